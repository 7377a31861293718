use serde::{Deserialize, Serialize};

use crate::error::AddressConversionError;

const LINEAR_WRAM_BASE: u32 = 0x7E0000;
const LINEAR_SAVE_BASE: u32 = 0xA06000;
const DEVICE_WRAM_BASE: u32 = 0xF50000;
const DEVICE_SAVE_BASE: u32 = 0xE00000;

/// Save RAM is mapped in 0x2000 byte windows that repeat every 0x10000 bytes
/// in the linear layout.
const SAVE_WINDOW: u32 = 0x2000;
const SAVE_STRIDE: u32 = 0x10000;

/// Addressing convention used by an emulator, a bridge or a device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub enum AddressFormat {
    /// Bus addresses as a snes9x style emulator sees them.
    #[default]
    LinearOffset,
    /// Offsets into each memory domain, as BizHawk exposes them.
    ZeroBased,
    /// The flat address space of FX Pak Pro style hardware.
    DeviceAbsolute,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub enum MemoryDomain {
    #[default]
    ConsoleRam,
    CartridgeSave,
    Rom,
}

impl MemoryDomain {
    pub fn is_rom(self) -> bool {
        self == MemoryDomain::Rom
    }
}

pub fn convert(
    address: u32,
    domain: MemoryDomain,
    from: AddressFormat,
    to: AddressFormat,
) -> Result<u32, AddressConversionError> {
    if from == to || domain.is_rom() {
        return Ok(address);
    }
    let offset = to_offset(address, domain, from)?;
    from_offset(offset, domain, to)
}

/// Contiguous offset of `address` inside its domain.
fn to_offset(
    address: u32,
    domain: MemoryDomain,
    format: AddressFormat,
) -> Result<u32, AddressConversionError> {
    let out_of_range = || AddressConversionError::OutOfRange {
        address,
        domain,
        format,
    };
    match (domain, format) {
        (MemoryDomain::Rom, _) | (_, AddressFormat::ZeroBased) => Ok(address),
        (MemoryDomain::ConsoleRam, AddressFormat::LinearOffset) => {
            address.checked_sub(LINEAR_WRAM_BASE).ok_or_else(out_of_range)
        }
        (MemoryDomain::ConsoleRam, AddressFormat::DeviceAbsolute) => {
            address.checked_sub(DEVICE_WRAM_BASE).ok_or_else(out_of_range)
        }
        (MemoryDomain::CartridgeSave, AddressFormat::LinearOffset) => {
            let linear = address.checked_sub(LINEAR_SAVE_BASE).ok_or_else(out_of_range)?;
            Ok(linear / SAVE_STRIDE * SAVE_WINDOW + linear % SAVE_STRIDE)
        }
        (MemoryDomain::CartridgeSave, AddressFormat::DeviceAbsolute) => {
            address.checked_sub(DEVICE_SAVE_BASE).ok_or_else(out_of_range)
        }
    }
}

fn from_offset(
    offset: u32,
    domain: MemoryDomain,
    format: AddressFormat,
) -> Result<u32, AddressConversionError> {
    let out_of_range = || AddressConversionError::OutOfRange {
        address: offset,
        domain,
        format,
    };
    match (domain, format) {
        (MemoryDomain::Rom, _) | (_, AddressFormat::ZeroBased) => Ok(offset),
        (MemoryDomain::ConsoleRam, AddressFormat::LinearOffset) => {
            offset.checked_add(LINEAR_WRAM_BASE).ok_or_else(out_of_range)
        }
        (MemoryDomain::ConsoleRam, AddressFormat::DeviceAbsolute) => {
            offset.checked_add(DEVICE_WRAM_BASE).ok_or_else(out_of_range)
        }
        (MemoryDomain::CartridgeSave, AddressFormat::LinearOffset) => (offset / SAVE_WINDOW)
            .checked_mul(SAVE_STRIDE)
            .and_then(|banks| banks.checked_add(offset % SAVE_WINDOW))
            .and_then(|linear| linear.checked_add(LINEAR_SAVE_BASE))
            .ok_or_else(out_of_range),
        (MemoryDomain::CartridgeSave, AddressFormat::DeviceAbsolute) => {
            offset.checked_add(DEVICE_SAVE_BASE).ok_or_else(out_of_range)
        }
    }
}
