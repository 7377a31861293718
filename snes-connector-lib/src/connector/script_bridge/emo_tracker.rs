use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use super::{domain_name, framing::Framing, Reply, ScriptDialect, Target};

const VERSION: i64 = 0xE2;
const READ_BLOCK: i64 = 0x0F;
const WRITE_U8: i64 = 0x10;
const WRITE_U16: i64 = 0x11;
const WRITE_U32: i64 = 0x12;
const WRITE_BLOCK: i64 = 0x1F;

#[derive(Debug, Default, Serialize)]
struct Command {
    id: u64,
    address: u32,
    value: i64,
    #[serde(rename = "type")]
    kind: i64,
    block: String,
    domain: String,
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(rename = "type")]
    kind: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    block: String,
}

fn encode(command: &Command) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(command)?;
    let mut message = u32::try_from(body.len())?.to_be_bytes().to_vec();
    message.extend(body);
    Ok(message)
}

/// Domains are only named to emulators that use zero-based addressing; the
/// others resolve everything from the bus address.
fn domain_for(target: &Target) -> String {
    if target.zero_based {
        domain_name(target.domain).to_owned()
    } else {
        String::new()
    }
}

/// Splits a write into as few fixed-width stores as possible: 4 bytes, then
/// 2, then 1. Returns `(offset, opcode, little-endian value)`.
fn chunk_writes(data: &[u8]) -> Vec<(usize, i64, i64)> {
    let mut writes = vec![];
    let mut offset = 0;
    while offset < data.len() {
        let rest = &data[offset..];
        let (kind, width, value) = match rest {
            [a, b, c, d, ..] => (WRITE_U32, 4, u32::from_le_bytes([*a, *b, *c, *d]) as i64),
            [a, b, ..] => (WRITE_U16, 2, u16::from_le_bytes([*a, *b]) as i64),
            [a, ..] => (WRITE_U8, 1, *a as i64),
            [] => break,
        };
        writes.push((offset, kind, value));
        offset += width;
    }
    writes
}

/// Length prefixed JSON with numeric opcodes, spoken by the EmoTracker
/// autotracking scripts and their derivatives.
pub(super) struct EmoTrackerDialect;

impl ScriptDialect for EmoTrackerDialect {
    fn framing(&self) -> Framing {
        Framing::Prefixed
    }

    fn probe(&self) -> Result<Vec<Vec<u8>>> {
        Ok(vec![encode(&Command {
            kind: VERSION,
            ..Default::default()
        })?])
    }

    fn read(&self, target: &Target) -> Result<Vec<u8>> {
        encode(&Command {
            kind: READ_BLOCK,
            address: target.address,
            value: i64::try_from(target.length)?,
            domain: domain_for(target),
            ..Default::default()
        })
    }

    fn write(&self, target: &Target, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        if !target.zero_based {
            return Ok(vec![encode(&Command {
                kind: WRITE_BLOCK,
                address: target.address,
                block: STANDARD.encode(data),
                ..Default::default()
            })?]);
        }
        chunk_writes(data)
            .into_iter()
            .map(|(offset, kind, value)| {
                encode(&Command {
                    kind,
                    address: target.address + offset as u32,
                    value,
                    domain: domain_for(target),
                    ..Default::default()
                })
            })
            .collect()
    }

    fn parse(&self, frame: &str) -> Result<Reply> {
        let response: Response = serde_json::from_str(frame)?;
        Ok(match response.kind {
            VERSION => Reply::Version {
                zero_based: response.message != "Not Supported"
                    && response.message != "Unsupported",
                peer: response.message,
            },
            READ_BLOCK => Reply::Memory(STANDARD.decode(response.block.as_bytes())?),
            _ => Reply::Ignored,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use crate::address::MemoryDomain;

    use super::*;

    fn body(message: &[u8]) -> Value {
        let length = u32::from_be_bytes([message[0], message[1], message[2], message[3]]);
        assert_eq!(length as usize, message.len() - 4);
        serde_json::from_slice(&message[4..]).unwrap()
    }

    #[test]
    fn writes_are_chunked_four_two_one() {
        assert_eq!(
            chunk_writes(&[1, 2, 3, 4, 5, 6, 7]),
            vec![
                (0, WRITE_U32, 0x04030201),
                (4, WRITE_U16, 0x0605),
                (6, WRITE_U8, 0x07),
            ]
        );
        assert_eq!(
            chunk_writes(&[1, 2, 3]),
            vec![(0, WRITE_U16, 0x0201), (2, WRITE_U8, 0x03)]
        );
    }

    #[test]
    fn zero_based_writes_name_the_domain() {
        let target = Target {
            address: 0x10,
            length: 0,
            domain: MemoryDomain::ConsoleRam,
            zero_based: true,
        };
        let messages = EmoTrackerDialect.write(&target, &[0xAA, 0xBB, 0xCC]).unwrap();
        assert_eq!(messages.len(), 2);
        let second = body(&messages[1]);
        assert_eq!(second["type"], WRITE_U8);
        assert_eq!(second["address"], 0x12);
        assert_eq!(second["domain"], "WRAM");

        let target = Target {
            address: 0x7E0010,
            zero_based: false,
            ..target
        };
        let messages = EmoTrackerDialect.write(&target, &[0x34, 0x12]).unwrap();
        let block = body(&messages[0]);
        assert_eq!(block["type"], WRITE_BLOCK);
        assert_eq!(block["block"], "NBI=");
        assert_eq!(block["domain"], "");
    }

    #[test]
    fn replies_decode() {
        assert!(matches!(
            EmoTrackerDialect
                .parse(r#"{"type":226,"message":"Not Supported"}"#)
                .unwrap(),
            Reply::Version { zero_based: false, .. }
        ));
        assert!(matches!(
            EmoTrackerDialect.parse(r#"{"type":226,"message":"BizHawk 2.9"}"#).unwrap(),
            Reply::Version { zero_based: true, .. }
        ));
        assert!(matches!(
            EmoTrackerDialect.parse(r#"{"type":15,"block":"NBI="}"#).unwrap(),
            Reply::Memory(bytes) if bytes == [0x34, 0x12]
        ));
    }
}
