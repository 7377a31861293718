use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{domain_name, framing::Framing, Reply, ScriptDialect, Target};

const TERMINATOR: u8 = 0;

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct Command<'a> {
    action: &'a str,
    #[serde(skip_serializing_if = "is_blank")]
    domain: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    length: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    write_values: Option<&'a [u8]>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Response {
    action: String,
    #[serde(default)]
    bytes: Vec<u8>,
    #[serde(default)]
    value: Value,
}

fn is_blank(value: &&str) -> bool {
    value.is_empty()
}

fn encode(command: &Command) -> Result<Vec<u8>> {
    let mut message = serde_json::to_vec(command)?;
    message.push(TERMINATOR);
    Ok(message)
}

/// NUL terminated JSON commands; replies come back one JSON object per line.
/// Addresses and lengths travel as hexadecimal strings.
pub(super) struct DefaultDialect;

impl ScriptDialect for DefaultDialect {
    fn framing(&self) -> Framing {
        Framing::Line
    }

    fn probe(&self) -> Result<Vec<Vec<u8>>> {
        Ok(vec![encode(&Command {
            action: "version",
            ..Default::default()
        })?])
    }

    fn read(&self, target: &Target) -> Result<Vec<u8>> {
        encode(&Command {
            action: "read_block",
            domain: domain_name(target.domain),
            address: Some(format!("{:X}", target.address)),
            length: Some(format!("{:X}", target.length)),
            ..Default::default()
        })
    }

    fn write(&self, target: &Target, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(vec![encode(&Command {
            action: "write_bytes",
            domain: domain_name(target.domain),
            address: Some(format!("{:X}", target.address)),
            write_values: Some(data),
            ..Default::default()
        })?])
    }

    fn parse(&self, frame: &str) -> Result<Reply> {
        let response: Response = serde_json::from_str(frame)?;
        Ok(match response.action.as_str() {
            "version" => {
                let peer = match response.value {
                    Value::String(value) => value,
                    value => value.to_string(),
                };
                Reply::Version {
                    zero_based: peer.eq_ignore_ascii_case("bizhawk"),
                    peer,
                }
            }
            "read_block" => Reply::Memory(response.bytes),
            _ => Reply::Ignored,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::address::MemoryDomain;

    use super::*;

    #[test]
    fn commands_are_nul_terminated_json() {
        let target = Target {
            address: 0xA0,
            length: 16,
            domain: MemoryDomain::CartridgeSave,
            zero_based: true,
        };
        let message = DefaultDialect.read(&target).unwrap();
        assert_eq!(message.last(), Some(&0));
        assert_eq!(
            std::str::from_utf8(&message[..message.len() - 1]).unwrap(),
            r#"{"action":"read_block","domain":"CARTRAM","address":"A0","length":"10"}"#
        );

        let writes = DefaultDialect.write(&target, &[1, 2]).unwrap();
        assert!(std::str::from_utf8(&writes[0])
            .unwrap()
            .contains(r#""writeValues":[1,2]"#));
    }

    #[test]
    fn version_reply_selects_addressing() {
        let reply = DefaultDialect
            .parse(r#"{"action":"version","value":"BizHawk"}"#)
            .unwrap();
        assert!(matches!(reply, Reply::Version { zero_based: true, .. }));
        let reply = DefaultDialect
            .parse(r#"{"action":"version","value":"snes9x-rr"}"#)
            .unwrap();
        assert!(matches!(reply, Reply::Version { zero_based: false, .. }));
        assert!(matches!(
            DefaultDialect.parse(r#"{"action":"read_block","bytes":[52,18]}"#).unwrap(),
            Reply::Memory(bytes) if bytes == [52, 18]
        ));
        assert!(DefaultDialect.parse("not json").is_err());
    }
}
