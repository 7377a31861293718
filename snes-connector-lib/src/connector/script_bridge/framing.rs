/// How inbound messages from a companion script are delimited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Framing {
    /// Text terminated by a newline or NUL.
    Line,
    /// A big-endian `u32` length followed by that many bytes of JSON. A bare
    /// object without prefix is accepted as well.
    Prefixed,
}

const PREFIX_LEN: usize = 4;
const MAX_FRAME_LEN: usize = 1 << 20;

pub(super) struct FrameDecoder {
    framing: Framing,
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buffer: Vec::new(),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn next_frame(&mut self) -> Option<String> {
        match self.framing {
            Framing::Line => self.next_line(),
            Framing::Prefixed => self.next_prefixed(),
        }
    }

    fn next_line(&mut self) -> Option<String> {
        loop {
            let end = self.buffer.iter().position(|&x| x == b'\n' || x == 0)?;
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line[..end]);
            let line = line.trim();
            if !line.is_empty() {
                return Some(line.to_owned());
            }
        }
    }

    fn next_prefixed(&mut self) -> Option<String> {
        loop {
            // A length this large would start with a brace, so a leading
            // brace is always a bare object.
            if *self.buffer.first()? == b'{' {
                return self.next_object();
            }
            if self.buffer.len() <= PREFIX_LEN {
                return None;
            }
            let mut prefix = [0; PREFIX_LEN];
            prefix.copy_from_slice(&self.buffer[..PREFIX_LEN]);
            let len = u32::from_be_bytes(prefix) as usize;
            if len == 0 || len > MAX_FRAME_LEN || self.buffer[PREFIX_LEN] != b'{' {
                // Not a frame boundary; resync one byte at a time.
                self.buffer.remove(0);
                continue;
            }
            if self.buffer.len() < PREFIX_LEN + len {
                return None;
            }
            let frame: Vec<u8> = self.buffer.drain(..PREFIX_LEN + len).collect();
            return Some(String::from_utf8_lossy(&frame[PREFIX_LEN..]).into_owned());
        }
    }

    fn next_object(&mut self) -> Option<String> {
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (index, &byte) in self.buffer.iter().enumerate() {
            if in_string {
                match byte {
                    _ if escaped => escaped = false,
                    b'\\' => escaped = true,
                    b'"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match byte {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        let object: Vec<u8> = self.buffer.drain(..=index).collect();
                        return Some(String::from_utf8_lossy(&object).into_owned());
                    }
                }
                _ => {}
            }
        }
        None
    }
}
