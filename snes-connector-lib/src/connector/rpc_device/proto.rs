//! Messages and a unary client for the SNI device services, written in the
//! shape `tonic-build` generates.

use std::time::Duration;

use http::uri::PathAndQuery;
use tonic::{
    client::Grpc,
    codec::ProstCodec,
    transport::{Channel, Endpoint},
    Status,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum DeviceCapability {
    None = 0,
    ReadMemory = 1,
    WriteMemory = 2,
    ExecuteAsm = 3,
    ResetSystem = 4,
    PauseUnpauseEmulation = 5,
    PauseToggleEmulation = 6,
    ResetToMenu = 7,
    FetchFields = 8,
    ReadDirectory = 10,
    MakeDirectory = 11,
    RemoveFile = 12,
    RenameFile = 13,
    PutFile = 14,
    GetFile = 15,
    BootFile = 16,
    NwaCommand = 20,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum AddressSpace {
    FxPakPro = 0,
    SnesABus = 1,
    Raw = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MemoryMapping {
    Unknown = 0,
    HiRom = 1,
    LoRom = 2,
    ExHiRom = 3,
    Sa1 = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum DirEntryType {
    Directory = 0,
    File = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DevicesRequest {
    #[prost(string, repeated, tag = "1")]
    pub kinds: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Device {
    #[prost(string, tag = "1")]
    pub uri: String,
    #[prost(string, tag = "2")]
    pub display_name: String,
    #[prost(string, tag = "3")]
    pub kind: String,
    #[prost(enumeration = "DeviceCapability", repeated, tag = "4")]
    pub capabilities: Vec<i32>,
    #[prost(enumeration = "AddressSpace", tag = "6")]
    pub default_address_space: i32,
    #[prost(string, tag = "7")]
    pub system: String,
}

impl Device {
    pub fn has_capability(&self, capability: DeviceCapability) -> bool {
        self.capabilities.contains(&(capability as i32))
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DevicesResponse {
    #[prost(message, repeated, tag = "1")]
    pub devices: Vec<Device>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReadMemoryRequest {
    #[prost(uint32, tag = "1")]
    pub request_address: u32,
    #[prost(enumeration = "AddressSpace", tag = "2")]
    pub request_address_space: i32,
    #[prost(enumeration = "MemoryMapping", tag = "4")]
    pub request_memory_mapping: i32,
    #[prost(uint32, tag = "3")]
    pub size: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReadMemoryResponse {
    #[prost(uint32, tag = "1")]
    pub request_address: u32,
    #[prost(enumeration = "AddressSpace", tag = "2")]
    pub request_address_space: i32,
    #[prost(enumeration = "MemoryMapping", tag = "6")]
    pub request_memory_mapping: i32,
    #[prost(uint32, tag = "3")]
    pub device_address: u32,
    #[prost(enumeration = "AddressSpace", tag = "4")]
    pub device_address_space: i32,
    #[prost(bytes = "vec", tag = "5")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WriteMemoryRequest {
    #[prost(uint32, tag = "1")]
    pub request_address: u32,
    #[prost(enumeration = "AddressSpace", tag = "2")]
    pub request_address_space: i32,
    #[prost(enumeration = "MemoryMapping", tag = "4")]
    pub request_memory_mapping: i32,
    #[prost(bytes = "vec", tag = "3")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WriteMemoryResponse {
    #[prost(uint32, tag = "1")]
    pub request_address: u32,
    #[prost(enumeration = "AddressSpace", tag = "2")]
    pub request_address_space: i32,
    #[prost(enumeration = "MemoryMapping", tag = "6")]
    pub request_memory_mapping: i32,
    #[prost(uint32, tag = "3")]
    pub device_address: u32,
    #[prost(enumeration = "AddressSpace", tag = "4")]
    pub device_address_space: i32,
    #[prost(uint32, tag = "5")]
    pub size: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SingleReadMemoryRequest {
    #[prost(string, tag = "1")]
    pub uri: String,
    #[prost(message, optional, tag = "2")]
    pub request: Option<ReadMemoryRequest>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SingleReadMemoryResponse {
    #[prost(string, tag = "1")]
    pub uri: String,
    #[prost(message, optional, tag = "2")]
    pub response: Option<ReadMemoryResponse>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SingleWriteMemoryRequest {
    #[prost(string, tag = "1")]
    pub uri: String,
    #[prost(message, optional, tag = "2")]
    pub request: Option<WriteMemoryRequest>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SingleWriteMemoryResponse {
    #[prost(string, tag = "1")]
    pub uri: String,
    #[prost(message, optional, tag = "2")]
    pub response: Option<WriteMemoryResponse>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DirEntry {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(enumeration = "DirEntryType", tag = "2")]
    pub r#type: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReadDirectoryRequest {
    #[prost(string, tag = "1")]
    pub uri: String,
    #[prost(string, tag = "2")]
    pub path: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReadDirectoryResponse {
    #[prost(string, tag = "1")]
    pub uri: String,
    #[prost(string, tag = "2")]
    pub path: String,
    #[prost(message, repeated, tag = "3")]
    pub entries: Vec<DirEntry>,
}

/// Request and response of the path-only filesystem calls.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PathRequest {
    #[prost(string, tag = "1")]
    pub uri: String,
    #[prost(string, tag = "2")]
    pub path: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PutFileRequest {
    #[prost(string, tag = "1")]
    pub uri: String,
    #[prost(string, tag = "2")]
    pub path: String,
    #[prost(bytes = "vec", tag = "3")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PutFileResponse {
    #[prost(string, tag = "1")]
    pub uri: String,
    #[prost(string, tag = "2")]
    pub path: String,
    #[prost(uint32, tag = "3")]
    pub size: u32,
}

#[derive(Debug, Clone)]
pub struct DeviceServiceClient {
    inner: Grpc<Channel>,
    deadline: Duration,
}

impl DeviceServiceClient {
    /// The channel connects on first use, so an unreachable service shows up
    /// as a failed call rather than here.
    pub fn connect_lazy(url: String, deadline: Duration) -> Result<Self, tonic::transport::Error> {
        let channel = Endpoint::from_shared(url)?
            .connect_timeout(deadline)
            .connect_lazy();
        Ok(Self {
            inner: Grpc::new(channel),
            deadline,
        })
    }

    async fn unary<M1, M2>(&mut self, path: &'static str, message: M1) -> Result<M2, Status>
    where
        M1: prost::Message + Send + Sync + 'static,
        M2: prost::Message + Default + Send + Sync + 'static,
    {
        self.inner
            .ready()
            .await
            .map_err(|err| Status::unavailable(format!("Service was not ready: {}", err)))?;
        let codec = ProstCodec::<M1, M2>::default();
        let mut request = tonic::Request::new(message);
        request.set_timeout(self.deadline);
        let call = self
            .inner
            .unary(request, PathAndQuery::from_static(path), codec);
        match tokio::time::timeout(self.deadline, call).await {
            Ok(response) => Ok(response?.into_inner()),
            Err(_) => Err(Status::deadline_exceeded(path)),
        }
    }

    pub async fn list_devices(&mut self, request: DevicesRequest) -> Result<DevicesResponse, Status> {
        self.unary("/Devices/ListDevices", request).await
    }

    pub async fn single_read(
        &mut self,
        request: SingleReadMemoryRequest,
    ) -> Result<SingleReadMemoryResponse, Status> {
        self.unary("/DeviceMemory/SingleRead", request).await
    }

    pub async fn single_write(
        &mut self,
        request: SingleWriteMemoryRequest,
    ) -> Result<SingleWriteMemoryResponse, Status> {
        self.unary("/DeviceMemory/SingleWrite", request).await
    }

    pub async fn read_directory(
        &mut self,
        request: ReadDirectoryRequest,
    ) -> Result<ReadDirectoryResponse, Status> {
        self.unary("/DeviceFilesystem/ReadDirectory", request).await
    }

    pub async fn make_directory(&mut self, request: PathRequest) -> Result<PathRequest, Status> {
        self.unary("/DeviceFilesystem/MakeDirectory", request).await
    }

    pub async fn remove_file(&mut self, request: PathRequest) -> Result<PathRequest, Status> {
        self.unary("/DeviceFilesystem/RemoveFile", request).await
    }

    pub async fn put_file(&mut self, request: PutFileRequest) -> Result<PutFileResponse, Status> {
        self.unary("/DeviceFilesystem/PutFile", request).await
    }

    pub async fn boot_file(&mut self, request: PathRequest) -> Result<PathRequest, Status> {
        self.unary("/DeviceFilesystem/BootFile", request).await
    }
}
