use thiserror::Error;

use crate::address::{AddressFormat, MemoryDomain};

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum AddressConversionError {
    #[error("address {address:#08X} lies outside the {domain:?} range of the {format:?} layout")]
    OutOfRange {
        address: u32,
        domain: MemoryDomain,
        format: AddressFormat,
    },
}

/// Failure of a single filesystem or command verb. It is handed to the
/// request's own callback and never changes the connection state.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FileTransferError {
    #[error("unable to read local file {path}: {reason}")]
    LocalFile { path: String, reason: String },
    #[error("device rejected the request: {0}")]
    Rejected(String),
    #[error("connection was lost before the request completed")]
    Disconnected,
    #[error("the active connector does not support this request")]
    Unsupported,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}
