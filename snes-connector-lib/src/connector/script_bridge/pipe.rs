use anyhow::Result;
use serde::Deserialize;

use super::{domain_name, framing::Framing, Reply, ScriptDialect, Target};

#[derive(Debug, Deserialize)]
struct DataReply {
    data: Vec<u8>,
}

fn line(text: String) -> Vec<u8> {
    let mut message = text.into_bytes();
    message.extend(b"\n\0");
    message
}

/// Pipe separated text commands used by the SNI companion script.
pub(super) struct PipeDialect;

impl ScriptDialect for PipeDialect {
    fn framing(&self) -> Framing {
        Framing::Line
    }

    fn probe(&self) -> Result<Vec<Vec<u8>>> {
        Ok(vec![line("Version".to_owned())])
    }

    fn read(&self, target: &Target) -> Result<Vec<u8>> {
        Ok(line(format!(
            "Read|{}|{}|{}",
            target.address,
            target.length,
            domain_name(target.domain)
        )))
    }

    fn write(&self, target: &Target, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut fields = vec!["Write".to_owned(), target.address.to_string()];
        if target.zero_based {
            fields.push(domain_name(target.domain).to_owned());
        }
        fields.extend(data.iter().map(|x| x.to_string()));
        Ok(vec![line(fields.join("|"))])
    }

    fn parse(&self, frame: &str) -> Result<Reply> {
        if frame.starts_with("Version") {
            return Ok(Reply::Version {
                zero_based: frame.to_ascii_lowercase().contains("bizhawk"),
                peer: frame.to_owned(),
            });
        }
        if frame.starts_with('{') {
            let reply: DataReply = serde_json::from_str(frame)?;
            return Ok(Reply::Memory(reply.data));
        }
        Ok(Reply::Memory(hex::decode(frame)?))
    }
}
