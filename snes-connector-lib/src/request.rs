mod file;
mod memory;

use std::{fmt, sync::Arc};

use crate::capabilities::Capability;

pub use file::{
    BootRomRequest, CommandOutcome, CreateDirectoryRequest, DeleteDirectoryRequest,
    DeleteFileRequest, EntryFilter, FileEntry, FileListRequest, UploadFileRequest,
};
pub(crate) use memory::Fingerprint;
pub use memory::{MemoryMapping, MemoryRequest, RecurringMemoryRequest, RequestFilter};

/// Completion handler attached to a request. Shared so that requests (and the
/// events that carry them back) stay cheaply cloneable.
pub struct Callback<T>(Arc<dyn Fn(T) + Send + Sync>);

impl<T> Callback<T> {
    pub fn new(f: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn call(&self, value: T) {
        (self.0)(value)
    }
}

impl<T> Clone for Callback<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> fmt::Debug for Callback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callback")
    }
}

#[derive(Clone, Debug)]
pub enum Request {
    RetrieveMemory(MemoryRequest),
    UpdateMemory(MemoryRequest),
    ListFiles(FileListRequest),
    BootRom(BootRomRequest),
    UploadFile(UploadFileRequest),
    DeleteFile(DeleteFileRequest),
    CreateDirectory(CreateDirectoryRequest),
    DeleteDirectory(DeleteDirectoryRequest),
}

impl Request {
    pub fn required_capability(&self) -> Capability {
        match self {
            Request::RetrieveMemory(request) if request.domain().is_rom() => Capability::ReadRom,
            Request::UpdateMemory(request) if request.domain().is_rom() => Capability::WriteRom,
            Request::RetrieveMemory(_) | Request::UpdateMemory(_) => Capability::ReadMemory,
            Request::BootRom(_) => Capability::PerformCommands,
            Request::ListFiles(_)
            | Request::UploadFile(_)
            | Request::DeleteFile(_)
            | Request::CreateDirectory(_)
            | Request::DeleteDirectory(_) => Capability::AccessFiles,
        }
    }

    pub fn is_memory_request(&self) -> bool {
        matches!(self, Request::RetrieveMemory(_) | Request::UpdateMemory(_))
    }
}

impl From<MemoryRequest> for Request {
    fn from(request: MemoryRequest) -> Self {
        if request.is_update() {
            Request::UpdateMemory(request)
        } else {
            Request::RetrieveMemory(request)
        }
    }
}
