pub mod address;
pub mod capabilities;
pub mod connector;
pub mod error;
pub mod memory_block;
pub mod orchestrator;
pub mod request;
pub mod settings;

pub use address::{convert, AddressFormat, MemoryDomain};
pub use capabilities::{Capability, ConnectorCapabilities};
pub use connector::{
    rpc_device::RpcDeviceConnector,
    script_bridge::{ScriptBridgeConnector, ScriptDialectKind},
    websocket_bridge::WebSocketBridgeConnector,
    ConnectionState, Connector, ConnectorEvent, ConnectorType,
};
pub use error::{AddressConversionError, ConfigError, FileTransferError};
pub use memory_block::MemoryBlock;
pub use orchestrator::{
    CommandResponse, ConnectorService, FileListResponse, MemoryResponse, ServiceEvent,
    SubscriptionId,
};
pub use request::{
    BootRomRequest, Callback, CreateDirectoryRequest, DeleteDirectoryRequest, DeleteFileRequest,
    FileEntry, FileListRequest, MemoryMapping, MemoryRequest, RecurringMemoryRequest, Request,
    UploadFileRequest,
};
pub use settings::ConnectorSettings;
