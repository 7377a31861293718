use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};

use crate::{
    address::{convert, AddressFormat, MemoryDomain},
    error::AddressConversionError,
    memory_block::MemoryBlock,
};

use super::Callback;

/// Cartridge memory mapping, forwarded to devices that need it to resolve
/// ROM and save addresses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum MemoryMapping {
    #[default]
    Unknown,
    HiRom,
    LoRom,
    ExHiRom,
    Sa1,
}

#[derive(Clone, Debug, CopyGetters, Getters)]
pub struct MemoryRequest {
    #[getset(get_copy = "pub")]
    address: u32,
    #[getset(get_copy = "pub")]
    length: usize,
    #[getset(get_copy = "pub")]
    domain: MemoryDomain,
    #[getset(get_copy = "pub")]
    address_format: AddressFormat,
    #[getset(get_copy = "pub")]
    mapping: MemoryMapping,
    #[getset(get = "pub")]
    data: Option<Bytes>,
    #[getset(get = "pub")]
    callback: Option<Callback<MemoryBlock>>,
    /// Set on representative requests issued for a recurring group.
    group: Option<Fingerprint>,
}

impl MemoryRequest {
    pub fn retrieve(
        address: u32,
        length: usize,
        domain: MemoryDomain,
        address_format: AddressFormat,
    ) -> Self {
        Self {
            address,
            length,
            domain,
            address_format,
            mapping: MemoryMapping::Unknown,
            data: None,
            callback: None,
            group: None,
        }
    }

    pub fn update(
        address: u32,
        data: impl Into<Bytes>,
        domain: MemoryDomain,
        address_format: AddressFormat,
    ) -> Self {
        let data = data.into();
        Self {
            length: data.len(),
            data: Some(data),
            ..Self::retrieve(address, 0, domain, address_format)
        }
    }

    pub fn with_mapping(mut self, mapping: MemoryMapping) -> Self {
        self.mapping = mapping;
        self
    }

    pub fn with_callback(mut self, f: impl Fn(MemoryBlock) + Send + Sync + 'static) -> Self {
        self.callback = Some(Callback::new(f));
        self
    }

    pub fn is_update(&self) -> bool {
        self.data.is_some()
    }

    pub fn translated_address(&self, format: AddressFormat) -> Result<u32, AddressConversionError> {
        convert(self.address, self.domain, self.address_format, format)
    }

    pub(crate) fn set_callback(&mut self, callback: Option<Callback<MemoryBlock>>) {
        self.callback = callback;
    }

    pub(crate) fn set_length(&mut self, length: usize) {
        self.length = length;
    }

    pub(crate) fn group(&self) -> Option<Fingerprint> {
        self.group
    }

    pub(crate) fn set_group(&mut self, group: Option<Fingerprint>) {
        self.group = group;
    }

    /// Block handed to callbacks: the bytes read, anchored at the requested
    /// address.
    pub(crate) fn to_block(&self, bytes: impl Into<Bytes>) -> MemoryBlock {
        MemoryBlock::with_origin(bytes, self.address)
    }
}

/// Key under which recurring reads of the same memory window are merged.
///
/// The address is normalized to the linear layout so that subscriptions
/// written against different conventions still meet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct Fingerprint {
    address: u32,
    domain: MemoryDomain,
}

impl Fingerprint {
    pub fn of(request: &MemoryRequest) -> Result<Self, AddressConversionError> {
        Ok(Self {
            address: request.translated_address(AddressFormat::LinearOffset)?,
            domain: request.domain(),
        })
    }
}

pub struct RequestFilter(Arc<dyn Fn() -> bool + Send + Sync>);

impl RequestFilter {
    pub fn new(f: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn passes(&self) -> bool {
        (self.0)()
    }
}

impl Clone for RequestFilter {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl fmt::Debug for RequestFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RequestFilter")
    }
}

/// A read that is repeated every `frequency` for as long as it stays
/// registered.
#[derive(Clone, Debug, CopyGetters, Getters)]
pub struct RecurringMemoryRequest {
    #[getset(get = "pub")]
    request: MemoryRequest,
    #[getset(get_copy = "pub")]
    frequency: Duration,
    #[getset(get = "pub")]
    filter: Option<RequestFilter>,
    #[getset(get_copy = "pub")]
    respond_on_change_only: bool,
    #[getset(get_copy = "pub")]
    last_run: Option<Instant>,
}

impl RecurringMemoryRequest {
    pub fn new(request: MemoryRequest, frequency: Duration) -> Self {
        Self {
            request,
            frequency,
            filter: None,
            respond_on_change_only: false,
            last_run: None,
        }
    }

    pub fn with_filter(mut self, f: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(RequestFilter::new(f));
        self
    }

    pub fn on_change_only(mut self) -> Self {
        self.respond_on_change_only = true;
        self
    }

    /// `None` means the request has never run and is due immediately.
    pub fn next_run(&self) -> Option<Instant> {
        self.last_run.map(|last_run| last_run + self.frequency)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.next_run().map_or(true, |next_run| next_run <= now)
    }

    pub fn can_run(&self, now: Instant) -> bool {
        self.is_due(now) && self.filter.as_ref().map_or(true, |filter| filter.passes())
    }

    pub(crate) fn set_last_run(&mut self, last_run: Option<Instant>) {
        self.last_run = last_run;
    }
}
