use std::fmt;

use bytes::Bytes;

/// Bytes read from a memory domain.
///
/// Offsets are relative to the start of the block. When the block knows the
/// address it was read from, the `*_at` accessors take absolute addresses in
/// the same format the request used.
#[derive(Clone, Default)]
pub struct MemoryBlock {
    bytes: Bytes,
    origin: Option<u32>,
}

impl MemoryBlock {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            origin: None,
        }
    }

    pub fn with_origin(bytes: impl Into<Bytes>, origin: u32) -> Self {
        Self {
            bytes: bytes.into(),
            origin: Some(origin),
        }
    }

    pub fn raw(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn origin(&self) -> Option<u32> {
        self.origin
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The first `length` bytes, sharing the same storage and origin.
    pub fn truncated(&self, length: usize) -> Self {
        Self {
            bytes: self.bytes.slice(..length.min(self.bytes.len())),
            origin: self.origin,
        }
    }

    pub fn read_u8(&self, offset: usize) -> Option<u8> {
        self.bytes.get(offset).copied()
    }

    pub fn read_u16(&self, offset: usize) -> Option<u16> {
        let buffer = self.bytes.get(offset..offset.checked_add(2)?)?;
        Some(u16::from_le_bytes([buffer[0], buffer[1]]))
    }

    /// `true` when any bit of `mask` is set in the byte at `offset`.
    pub fn check_u8_flag(&self, offset: usize, mask: u8) -> bool {
        self.read_u8(offset).is_some_and(|value| value & mask != 0)
    }

    /// `true` when bit number `bit` of the little-endian word at `offset` is set.
    pub fn check_u16_flag(&self, offset: usize, bit: u8) -> bool {
        let Some(mask) = 1u16.checked_shl(bit as u32) else {
            return false;
        };
        self.read_u16(offset).is_some_and(|value| value & mask != 0)
    }

    pub fn read_u8_at(&self, address: u32) -> Option<u8> {
        self.read_u8(self.relative(address)?)
    }

    pub fn read_u16_at(&self, address: u32) -> Option<u16> {
        self.read_u16(self.relative(address)?)
    }

    fn relative(&self, address: u32) -> Option<usize> {
        address
            .checked_sub(self.origin?)
            .and_then(|offset| usize::try_from(offset).ok())
    }
}

impl PartialEq for MemoryBlock {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for MemoryBlock {}

impl fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("origin", &self.origin.map(|x| format!("{:06X}", x)))
            .field("bytes", &self.bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_little_endian_words() {
        let block = MemoryBlock::new(vec![0x34, 0x12, 0xFF]);
        assert_eq!(block.read_u8(2), Some(0xFF));
        assert_eq!(block.read_u16(0), Some(0x1234));
        assert_eq!(block.read_u16(2), None);
        assert_eq!(block.read_u8(3), None);
    }

    #[test]
    fn checks_flags() {
        let block = MemoryBlock::new(vec![0b0000_0101, 0b1000_0000]);
        assert!(block.check_u8_flag(0, 0b100));
        assert!(!block.check_u8_flag(0, 0b010));
        assert!(block.check_u16_flag(0, 15));
        assert!(block.check_u16_flag(0, 2));
        assert!(!block.check_u16_flag(0, 3));
        assert!(!block.check_u16_flag(0, 16));
        assert!(!block.check_u8_flag(5, 0xFF));
    }

    #[test]
    fn absolute_reads_need_an_origin() {
        let block = MemoryBlock::with_origin(vec![1, 2, 3], 0x7E0100);
        assert_eq!(block.read_u8_at(0x7E0102), Some(3));
        assert_eq!(block.read_u16_at(0x7E0100), Some(0x0201));
        assert_eq!(block.read_u8_at(0x7E00FF), None);
        assert_eq!(MemoryBlock::new(vec![1]).read_u8_at(0), None);
    }

    #[test]
    fn equality_compares_contents() {
        assert_eq!(
            MemoryBlock::new(vec![1, 2]),
            MemoryBlock::with_origin(Bytes::from_static(&[1, 2]), 0x10)
        );
        assert_ne!(MemoryBlock::new(vec![1, 2]), MemoryBlock::new(vec![2, 1]));
    }

    #[test]
    fn truncation_keeps_the_origin() {
        let block = MemoryBlock::with_origin(vec![1, 2, 3], 0x7E0100);
        let short = block.truncated(2);
        assert_eq!(short.raw(), &[1, 2]);
        assert_eq!(short.read_u8_at(0x7E0101), Some(2));
        assert_eq!(block.truncated(10).len(), 3);
    }
}
