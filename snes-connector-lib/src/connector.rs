mod file_walk;
pub mod rpc_device;
pub mod script_bridge;
mod status;
pub mod websocket_bridge;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{
    capabilities::ConnectorCapabilities,
    memory_block::MemoryBlock,
    request::{
        BootRomRequest, CommandOutcome, CreateDirectoryRequest, DeleteDirectoryRequest,
        DeleteFileRequest, FileEntry, FileListRequest, MemoryRequest, Request, UploadFileRequest,
    },
    settings::ConnectorSettings,
};

pub(crate) use status::{lock, ConnectionStatus};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum ConnectorType {
    /// usb2snes / QUsb2Snes style WebSocket bridge.
    #[default]
    WebSocketBridge,
    /// SNI style gRPC device multiplexer.
    RpcDevice,
    ScriptBridge,
    ScriptBridgeEmoTracker,
    ScriptBridgeEmoTrackerVariant,
    ScriptBridgePipe,
}

impl ConnectorType {
    pub const ALL: [ConnectorType; 6] = [
        ConnectorType::WebSocketBridge,
        ConnectorType::RpcDevice,
        ConnectorType::ScriptBridge,
        ConnectorType::ScriptBridgeEmoTracker,
        ConnectorType::ScriptBridgeEmoTrackerVariant,
        ConnectorType::ScriptBridgePipe,
    ];
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Enabled and looking for (or attaching to) a device.
    Discovering,
    Connected,
    GameDetected,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::GameDetected)
    }
}

#[derive(Clone, Debug)]
pub enum ConnectorEvent {
    Connected,
    GameDetected,
    Disconnected,
    MemoryReceived {
        request: MemoryRequest,
        data: MemoryBlock,
    },
    MemoryUpdated {
        request: MemoryRequest,
    },
    FileListReceived {
        request: FileListRequest,
        files: Vec<FileEntry>,
    },
    RomBooted {
        request: BootRomRequest,
        outcome: CommandOutcome,
    },
    FileUploaded {
        request: UploadFileRequest,
        outcome: CommandOutcome,
    },
    FileDeleted {
        request: DeleteFileRequest,
        outcome: CommandOutcome,
    },
    DirectoryCreated {
        request: CreateDirectoryRequest,
        outcome: CommandOutcome,
    },
    DirectoryDeleted {
        request: DeleteDirectoryRequest,
        outcome: CommandOutcome,
    },
}

/// One transport to a device. Verbs return once the request has been handed
/// to the transport; results come back as [`ConnectorEvent`]s.
#[async_trait]
pub trait Connector: Send + Sync {
    fn connector_type(&self) -> ConnectorType;
    fn subscribe(&self) -> broadcast::Receiver<ConnectorEvent>;
    fn state(&self) -> ConnectionState;
    fn capabilities(&self) -> ConnectorCapabilities;
    /// A request is in flight.
    fn is_busy(&self) -> bool;

    fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    fn is_game_detected(&self) -> bool {
        self.state() == ConnectionState::GameDetected
    }

    fn can_process_requests(&self) -> bool {
        self.is_connected() && !self.is_busy()
    }

    fn can_make_request(&self, request: &Request) -> bool {
        self.can_process_requests()
            && self.capabilities().supports(request.required_capability())
            && (!request.is_memory_request() || self.is_game_detected())
    }

    async fn enable(&self, settings: &ConnectorSettings);
    async fn disable(&self);

    async fn retrieve_memory(&self, request: MemoryRequest);
    async fn update_memory(&self, request: MemoryRequest);
    async fn list_files(&self, request: FileListRequest);
    async fn boot_rom(&self, request: BootRomRequest);
    async fn upload_file(&self, request: UploadFileRequest);
    async fn delete_file(&self, request: DeleteFileRequest);
    async fn create_directory(&self, request: CreateDirectoryRequest);
    async fn delete_directory(&self, request: DeleteDirectoryRequest);

    async fn execute(&self, request: Request) {
        match request {
            Request::RetrieveMemory(request) => self.retrieve_memory(request).await,
            Request::UpdateMemory(request) => self.update_memory(request).await,
            Request::ListFiles(request) => self.list_files(request).await,
            Request::BootRom(request) => self.boot_rom(request).await,
            Request::UploadFile(request) => self.upload_file(request).await,
            Request::DeleteFile(request) => self.delete_file(request).await,
            Request::CreateDirectory(request) => self.create_directory(request).await,
            Request::DeleteDirectory(request) => self.delete_directory(request).await,
        }
    }
}
