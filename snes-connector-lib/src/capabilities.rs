use flagset::{flags, FlagSet};

flags! {
    pub enum Capability: u8 {
        ReadMemory,
        ReadRom,
        WriteRom,
        PerformCommands,
        AccessFiles,
    }
}

/// What the currently attached device and transport can do. Discovered on
/// every connect and reset on disconnect.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectorCapabilities(FlagSet<Capability>);

impl ConnectorCapabilities {
    pub fn new(flags: impl Into<FlagSet<Capability>>) -> Self {
        Self(flags.into())
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn memory_only() -> Self {
        Self::new(Capability::ReadMemory)
    }

    pub fn all() -> Self {
        Self(FlagSet::full())
    }

    pub fn with(self, capability: Capability, enabled: bool) -> Self {
        if enabled {
            Self(self.0 | capability)
        } else {
            Self(self.0 - capability)
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.0.contains(capability)
    }

    pub fn can_read_memory(&self) -> bool {
        self.supports(Capability::ReadMemory)
    }

    pub fn can_read_rom(&self) -> bool {
        self.supports(Capability::ReadRom)
    }

    pub fn can_write_rom(&self) -> bool {
        self.supports(Capability::WriteRom)
    }

    pub fn can_perform_commands(&self) -> bool {
        self.supports(Capability::PerformCommands)
    }

    pub fn can_access_files(&self) -> bool {
        self.supports(Capability::AccessFiles)
    }
}
