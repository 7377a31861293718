use serde::{Deserialize, Serialize};

use crate::capabilities::{Capability, ConnectorCapabilities};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub(super) enum Opcode {
    DeviceList,
    Attach,
    Name,
    Info,
    GetAddress,
    PutAddress,
    List,
    Boot,
    Remove,
    MakeDir,
    PutFile,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct Envelope {
    opcode: Opcode,
    space: &'static str,
    operands: Vec<String>,
}

impl Envelope {
    pub fn new<I, S>(opcode: Opcode, operands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            opcode,
            space: "SNES",
            operands: operands.into_iter().map(Into::into).collect(),
        }
    }

    pub fn in_space(mut self, space: &'static str) -> Self {
        self.space = space;
        self
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(super) struct Reply {
    #[serde(default)]
    pub results: Vec<String>,
}

pub(super) fn hex(value: impl Into<u64>) -> String {
    format!("{:X}", value.into())
}

/// What the bridge reports about the attached device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct DeviceInfo {
    pub name: String,
    pub firmware: String,
    pub device_type: String,
    pub rom: String,
    pub flags: Vec<String>,
}

impl DeviceInfo {
    /// `results` is `[firmware, device type, rom, flag...]`.
    pub fn parse(name: &str, results: &[String]) -> Self {
        let field = |index: usize| results.get(index).cloned().unwrap_or_default();
        Self {
            name: name.to_owned(),
            firmware: field(0),
            device_type: field(1),
            rom: field(2),
            flags: results.iter().skip(3).cloned().collect(),
        }
    }

    pub fn has_game(&self) -> bool {
        let rom = self.rom.trim();
        !rom.is_empty() && !rom.eq_ignore_ascii_case("no info") && !rom.ends_with(".bin")
    }

    pub fn capabilities(&self) -> ConnectorCapabilities {
        let lacks = |flag: &str| self.flags.iter().any(|x| x == flag);
        ConnectorCapabilities::memory_only()
            .with(Capability::ReadRom, !lacks("NO_ROM_READ"))
            .with(Capability::WriteRom, !lacks("NO_ROM_WRITE"))
            .with(Capability::PerformCommands, !lacks("NO_CONTROL_CMD"))
            .with(Capability::AccessFiles, !lacks("NO_FILE_CMD"))
    }

    /// FX Pak / SD2SNES hardware cannot write work RAM through the bridge and
    /// needs a generated program instead.
    pub fn needs_command_writes(&self) -> bool {
        [&self.name, &self.device_type].iter().any(|x| {
            let x = x.to_ascii_uppercase();
            x.contains("SD2SNES") || x.contains("FXPAK")
        })
    }
}

/// A `List` reply is a flat `[type, name, type, name, ...]` sequence where
/// type "0" marks a directory.
pub(super) fn parse_listing(results: &[String]) -> Vec<(String, bool)> {
    results
        .chunks_exact(2)
        .map(|pair| (pair[1].clone(), pair[0] == "0"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(list: &[&str]) -> Vec<String> {
        list.iter().map(|x| x.to_string()).collect()
    }

    #[test]
    fn envelopes_use_bridge_field_names() {
        let envelope = Envelope::new(Opcode::GetAddress, [hex(0xF50020u32), hex(2u32)]);
        assert_eq!(
            serde_json::to_string(&envelope).unwrap(),
            r#"{"Opcode":"GetAddress","Space":"SNES","Operands":["F50020","2"]}"#
        );
        let envelope = Envelope::new(Opcode::PutAddress, ["2C00"]).in_space("CMD");
        assert!(serde_json::to_string(&envelope)
            .unwrap()
            .contains(r#""Space":"CMD""#));
    }

    #[test]
    fn device_info_drives_capabilities() {
        let info = DeviceInfo::parse(
            "SNES9X",
            &strings(&["1.0", "SNES9X", "No Info", "NO_FILE_CMD", "NO_CONTROL_CMD"]),
        );
        assert!(!info.has_game());
        let caps = info.capabilities();
        assert!(caps.can_read_memory() && caps.can_read_rom() && caps.can_write_rom());
        assert!(!caps.can_access_files() && !caps.can_perform_commands());
        assert!(!info.needs_command_writes());

        let info = DeviceInfo::parse(
            "SD2SNES COM3",
            &strings(&["1.11.0", "SD2SNES", "/roms/smz3.sfc"]),
        );
        assert!(info.has_game());
        assert!(info.needs_command_writes());
        assert_eq!(info.capabilities(), ConnectorCapabilities::all());

        let menu = DeviceInfo::parse("SD2SNES COM3", &strings(&["1.11.0", "SD2SNES", "/sd2snes/m3nu.bin"]));
        assert!(!menu.has_game());
    }

    #[test]
    fn listing_pairs_types_and_names() {
        assert_eq!(
            parse_listing(&strings(&["0", "roms", "1", "game.sfc", "1"])),
            vec![("roms".to_owned(), true), ("game.sfc".to_owned(), false)]
        );
    }
}
