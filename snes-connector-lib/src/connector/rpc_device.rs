mod proto;

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::{select, spawn, sync::broadcast, time::sleep};
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};
use tracing::{debug, error, info, warn};

use crate::{
    address::AddressFormat,
    capabilities::{Capability, ConnectorCapabilities},
    error::FileTransferError,
    request::{
        BootRomRequest, CommandOutcome, CreateDirectoryRequest, DeleteDirectoryRequest,
        DeleteFileRequest, FileListRequest, MemoryMapping, MemoryRequest, UploadFileRequest,
    },
    settings::ConnectorSettings,
};

use self::proto::{
    AddressSpace, Device, DeviceCapability, DeviceServiceClient, DevicesRequest, DirEntryType,
    PathRequest, PutFileRequest, ReadDirectoryRequest, ReadMemoryRequest,
    SingleReadMemoryRequest, SingleWriteMemoryRequest, WriteMemoryRequest,
};

use super::{
    file_walk::{walk_directory, WalkOrder},
    lock, ConnectionState, ConnectionStatus, Connector, ConnectorEvent, ConnectorType,
};

const CALL_DEADLINE: Duration = Duration::from_secs(3);
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(3);
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);
const REDISCOVERY_COOLDOWN: Duration = Duration::from_secs(3);

fn device_capabilities(device: &Device) -> ConnectorCapabilities {
    let can_read = device.has_capability(DeviceCapability::ReadMemory);
    ConnectorCapabilities::none()
        .with(Capability::ReadMemory, can_read)
        .with(Capability::ReadRom, can_read)
        .with(
            Capability::WriteRom,
            device.has_capability(DeviceCapability::WriteMemory),
        )
        .with(
            Capability::PerformCommands,
            device.has_capability(DeviceCapability::BootFile),
        )
        .with(
            Capability::AccessFiles,
            device.has_capability(DeviceCapability::ReadDirectory),
        )
}

fn proto_mapping(mapping: MemoryMapping) -> proto::MemoryMapping {
    match mapping {
        MemoryMapping::Unknown => proto::MemoryMapping::Unknown,
        MemoryMapping::HiRom => proto::MemoryMapping::HiRom,
        MemoryMapping::LoRom => proto::MemoryMapping::LoRom,
        MemoryMapping::ExHiRom => proto::MemoryMapping::ExHiRom,
        MemoryMapping::Sa1 => proto::MemoryMapping::Sa1,
    }
}

/// Failures of the channel itself end the session; anything else is the
/// device refusing this one operation.
fn is_transport_failure(status: &Status) -> bool {
    matches!(
        status.code(),
        Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled
    )
}

struct Session {
    client: DeviceServiceClient,
    uri: String,
}

struct Inner {
    status: ConnectionStatus,
    settings: Mutex<ConnectorSettings>,
    session: Mutex<Option<Session>>,
    last_success: Mutex<Instant>,
}

impl Inner {
    async fn run(self: Arc<Self>, token: CancellationToken) {
        let url = lock(&self.settings).rpc_url();
        let client = match DeviceServiceClient::connect_lazy(url.clone(), CALL_DEADLINE) {
            Ok(client) => client,
            Err(err) => {
                error!("Invalid device service address {}: {}", url, err);
                self.status.give_up(&token);
                return;
            }
        };
        loop {
            let device = select! {
                _ = token.cancelled() => break,
                device = self.discover(client.clone()) => device,
            };
            info!("Attached to {} ({})", device.display_name, device.uri);
            {
                let mut session = lock(&self.session);
                if token.is_cancelled() {
                    break;
                }
                *session = Some(Session {
                    client: client.clone(),
                    uri: device.uri.clone(),
                });
            }
            self.touch();
            self.status.mark_connected(device_capabilities(&device));
            self.status.mark_game_detected();

            select! {
                _ = token.cancelled() => break,
                _ = self.watch() => {}
            }
            self.end_session(&token);
            select! {
                _ = token.cancelled() => break,
                _ = sleep(REDISCOVERY_COOLDOWN) => {}
            }
        }
    }

    /// Detaches the run owning `token`. Once that run is cancelled, `disable`
    /// has detached already and a newer run may own the session.
    fn end_session(&self, token: &CancellationToken) {
        let mut session = lock(&self.session);
        if token.is_cancelled() {
            return;
        }
        session.take();
        self.status.mark_disconnected();
    }

    async fn discover(&self, mut client: DeviceServiceClient) -> Device {
        loop {
            match client.list_devices(DevicesRequest { kinds: vec![] }).await {
                Ok(response) => match response.devices.into_iter().next() {
                    Some(device) => return device,
                    None => debug!("No devices reported by the device service"),
                },
                Err(status) => debug!("Device discovery failed: {}", status),
            }
            sleep(DISCOVERY_INTERVAL).await;
        }
    }

    /// Returns once the session is considered dead: a call failed or nothing
    /// succeeded within the configured timeout.
    async fn watch(&self) {
        let limit = Duration::from_secs(lock(&self.settings).timeout_seconds.max(1));
        loop {
            sleep(WATCHDOG_INTERVAL).await;
            if !self.status.is_connected() {
                return;
            }
            if lock(&self.last_success).elapsed() > limit {
                warn!("No successful device call for {:?}, detaching", limit);
                return;
            }
        }
    }

    fn touch(&self) {
        *lock(&self.last_success) = Instant::now();
    }

    fn session(&self) -> Option<(DeviceServiceClient, String)> {
        lock(&self.session)
            .as_ref()
            .map(|session| (session.client.clone(), session.uri.clone()))
    }

    fn fail(&self, status: &Status) {
        error!("Device call failed: {}", status);
        lock(&self.session).take();
        self.status.mark_disconnected();
    }

    /// Runs one filesystem call under the in-flight marker and maps its
    /// status to an outcome.
    async fn file_command<F, Fut, T>(&self, call: F) -> CommandOutcome
    where
        F: FnOnce(DeviceServiceClient, String) -> Fut,
        Fut: std::future::Future<Output = Result<T, Status>>,
    {
        let Some((client, uri)) = self.session() else {
            return Err(FileTransferError::Disconnected);
        };
        if !self.status.try_begin_request() {
            return Err(FileTransferError::Rejected(
                "a request is already in flight".to_owned(),
            ));
        }
        let result = call(client, uri).await;
        self.status.finish_request();
        match result {
            Ok(_) => {
                self.touch();
                Ok(())
            }
            Err(status) if is_transport_failure(&status) => {
                self.fail(&status);
                Err(FileTransferError::Disconnected)
            }
            Err(status) => {
                self.touch();
                Err(FileTransferError::Rejected(status.message().to_owned()))
            }
        }
    }
}

/// Client of an SNI style gRPC service that multiplexes emulators and
/// hardware behind one endpoint.
pub struct RpcDeviceConnector {
    inner: Arc<Inner>,
}

impl RpcDeviceConnector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                status: ConnectionStatus::new(),
                settings: Mutex::new(ConnectorSettings::default()),
                session: Mutex::new(None),
                last_success: Mutex::new(Instant::now()),
            }),
        }
    }
}

impl Default for RpcDeviceConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for RpcDeviceConnector {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::RpcDevice
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.inner.status.subscribe()
    }

    fn state(&self) -> ConnectionState {
        self.inner.status.state()
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        self.inner.status.capabilities()
    }

    fn is_busy(&self) -> bool {
        self.inner.status.is_busy()
    }

    async fn enable(&self, settings: &ConnectorSettings) {
        *lock(&self.inner.settings) = settings.clone();
        if let Some(token) = self.inner.status.enable() {
            info!("Enabling device service connector");
            spawn(self.inner.clone().run(token));
        }
    }

    async fn disable(&self) {
        info!("Disabling device service connector");
        self.inner.status.disable();
        lock(&self.inner.session).take();
    }

    async fn retrieve_memory(&self, request: MemoryRequest) {
        let address = match request.translated_address(AddressFormat::DeviceAbsolute) {
            Ok(address) => address,
            Err(err) => {
                error!("{}", err);
                return;
            }
        };
        let Some((mut client, uri)) = self.inner.session() else {
            warn!("Not attached to a device, dropped {:?}", request);
            return;
        };
        if !self.inner.status.try_begin_request() {
            warn!("Device service is busy, dropped {:?}", request);
            return;
        }
        let result = client
            .single_read(SingleReadMemoryRequest {
                uri,
                request: Some(ReadMemoryRequest {
                    request_address: address,
                    request_address_space: AddressSpace::FxPakPro as i32,
                    request_memory_mapping: proto_mapping(request.mapping()) as i32,
                    size: request.length() as u32,
                }),
            })
            .await;
        self.inner.status.finish_request();
        match result {
            Ok(response) => {
                self.inner.touch();
                let data = response
                    .response
                    .map(|response| response.data)
                    .unwrap_or_default();
                self.inner.status.emit(ConnectorEvent::MemoryReceived {
                    data: request.to_block(data),
                    request,
                });
            }
            Err(status) => self.inner.fail(&status),
        }
    }

    async fn update_memory(&self, request: MemoryRequest) {
        let address = match request.translated_address(AddressFormat::DeviceAbsolute) {
            Ok(address) => address,
            Err(err) => {
                error!("{}", err);
                return;
            }
        };
        let Some((mut client, uri)) = self.inner.session() else {
            warn!("Not attached to a device, dropped {:?}", request);
            return;
        };
        if !self.inner.status.try_begin_request() {
            warn!("Device service is busy, dropped {:?}", request);
            return;
        }
        let result = client
            .single_write(SingleWriteMemoryRequest {
                uri,
                request: Some(WriteMemoryRequest {
                    request_address: address,
                    request_address_space: AddressSpace::FxPakPro as i32,
                    request_memory_mapping: proto_mapping(request.mapping()) as i32,
                    data: request.data().clone().unwrap_or_default().to_vec(),
                }),
            })
            .await;
        self.inner.status.finish_request();
        match result {
            Ok(_) => {
                self.inner.touch();
                self.inner
                    .status
                    .emit(ConnectorEvent::MemoryUpdated { request });
            }
            Err(status) => self.inner.fail(&status),
        }
    }

    async fn list_files(&self, request: FileListRequest) {
        let Some((client, uri)) = self.inner.session() else {
            warn!("Not attached to a device, dropped {:?}", request);
            return;
        };
        if !self.inner.status.try_begin_request() {
            warn!("Device service is busy, dropped {:?}", request);
            return;
        }
        let result = walk_directory(&request, WalkOrder::DepthFirst, |path| {
            let mut client = client.clone();
            let uri = uri.clone();
            async move {
                let response = client
                    .read_directory(ReadDirectoryRequest { uri, path })
                    .await?;
                let entries = response
                    .entries
                    .into_iter()
                    .map(|entry| (entry.name, entry.r#type == DirEntryType::Directory as i32))
                    .collect();
                Ok::<_, anyhow::Error>(entries)
            }
        })
        .await;
        self.inner.status.finish_request();
        match result {
            Ok(files) => {
                self.inner.touch();
                self.inner
                    .status
                    .emit(ConnectorEvent::FileListReceived { request, files });
            }
            Err(err) => match err.downcast_ref::<Status>() {
                Some(status) if !is_transport_failure(status) => {
                    warn!("Listing {} failed: {}", request.path(), status);
                    self.inner.status.emit(ConnectorEvent::FileListReceived {
                        request,
                        files: vec![],
                    });
                }
                Some(status) => self.inner.fail(status),
                None => self.inner.fail(&Status::unknown(err.to_string())),
            },
        }
    }

    async fn boot_rom(&self, request: BootRomRequest) {
        let path = request.path().clone();
        let outcome = self
            .inner
            .file_command(|mut client, uri| async move {
                client.boot_file(PathRequest { uri, path }).await
            })
            .await;
        self.inner
            .status
            .emit(ConnectorEvent::RomBooted { request, outcome });
    }

    async fn upload_file(&self, request: UploadFileRequest) {
        let outcome = match tokio::fs::read(request.local_path()).await {
            Ok(data) => {
                info!(
                    "Uploading {} ({} bytes) to {}",
                    request.local_path(),
                    data.len(),
                    request.target_path()
                );
                let path = request.target_path().clone();
                self.inner
                    .file_command(|mut client, uri| async move {
                        client.put_file(PutFileRequest { uri, path, data }).await
                    })
                    .await
            }
            Err(err) => Err(FileTransferError::LocalFile {
                path: request.local_path().clone(),
                reason: err.to_string(),
            }),
        };
        if let Err(err) = &outcome {
            warn!("Upload of {} failed: {}", request.local_path(), err);
        }
        self.inner
            .status
            .emit(ConnectorEvent::FileUploaded { request, outcome });
    }

    async fn delete_file(&self, request: DeleteFileRequest) {
        let path = request.path().clone();
        let outcome = self
            .inner
            .file_command(|mut client, uri| async move {
                client.remove_file(PathRequest { uri, path }).await
            })
            .await;
        self.inner
            .status
            .emit(ConnectorEvent::FileDeleted { request, outcome });
    }

    async fn create_directory(&self, request: CreateDirectoryRequest) {
        let path = request.path().clone();
        let outcome = self
            .inner
            .file_command(|mut client, uri| async move {
                client.make_directory(PathRequest { uri, path }).await
            })
            .await;
        self.inner
            .status
            .emit(ConnectorEvent::DirectoryCreated { request, outcome });
    }

    async fn delete_directory(&self, request: DeleteDirectoryRequest) {
        let path = request.path().clone();
        let outcome = self
            .inner
            .file_command(|mut client, uri| async move {
                client.remove_file(PathRequest { uri, path }).await
            })
            .await;
        self.inner
            .status
            .emit(ConnectorEvent::DirectoryDeleted { request, outcome });
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        convert::Infallible,
        future::{ready, Ready},
        task::{Context, Poll},
    };

    use tokio::{net::TcpListener, time::timeout};
    use tonic::{
        body::BoxBody,
        codec::ProstCodec,
        codegen::{empty_body, http, Body, BoxFuture, Service, StdError},
        server::{Grpc, NamedService},
        transport::{server::TcpIncoming, Server},
    };

    use crate::address::MemoryDomain;

    use super::{
        proto::{
            DevicesResponse, DirEntry, ReadDirectoryResponse, ReadMemoryResponse,
            SingleReadMemoryResponse, SingleWriteMemoryResponse, WriteMemoryResponse,
        },
        *,
    };

    const WAIT: Duration = Duration::from_secs(10);
    const DEVICE_URI: &str = "fxpakpro://./dev/ttyACM0";

    #[derive(Default)]
    struct FakeDevices {
        devices: Vec<Device>,
        memory: HashMap<u32, u8>,
        reads: Vec<ReadMemoryRequest>,
        directories: Vec<String>,
    }

    /// Loopback device service, registered once per gRPC service name.
    #[derive(Clone)]
    struct FakeService<const SERVICE: u8>(Arc<Mutex<FakeDevices>>);

    impl NamedService for FakeService<0> {
        const NAME: &'static str = "Devices";
    }

    impl NamedService for FakeService<1> {
        const NAME: &'static str = "DeviceMemory";
    }

    impl NamedService for FakeService<2> {
        const NAME: &'static str = "DeviceFilesystem";
    }

    struct Handler<F>(F);

    impl<F, M1, M2> Service<tonic::Request<M1>> for Handler<F>
    where
        F: FnMut(M1) -> Result<M2, Status>,
    {
        type Response = tonic::Response<M2>;
        type Error = Status;
        type Future = Ready<Result<tonic::Response<M2>, Status>>;

        fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Status>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, request: tonic::Request<M1>) -> Self::Future {
            ready((self.0)(request.into_inner()).map(tonic::Response::new))
        }
    }

    async fn unary<M1, M2, B>(
        request: http::Request<B>,
        handler: impl FnMut(M1) -> Result<M2, Status> + Send + 'static,
    ) -> http::Response<BoxBody>
    where
        M1: prost::Message + Default + Send + 'static,
        M2: prost::Message + Send + 'static,
        B: Body + Send + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        Grpc::new(ProstCodec::<M2, M1>::default())
            .unary(Handler(handler), request)
            .await
    }

    impl<const SERVICE: u8, B> Service<http::Request<B>> for FakeService<SERVICE>
    where
        B: Body + Send + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        type Response = http::Response<BoxBody>;
        type Error = Infallible;
        type Future = BoxFuture<Self::Response, Self::Error>;

        fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, request: http::Request<B>) -> Self::Future {
            let devices = self.0.clone();
            let path = request.uri().path().to_owned();
            Box::pin(async move {
                let response = match path.as_str() {
                    "/Devices/ListDevices" => {
                        unary(request, move |_: DevicesRequest| {
                            Ok(DevicesResponse {
                                devices: lock(&devices).devices.clone(),
                            })
                        })
                        .await
                    }
                    "/DeviceMemory/SingleRead" => {
                        unary(request, move |message: SingleReadMemoryRequest| {
                            let read = message.request.unwrap_or_default();
                            let mut devices = lock(&devices);
                            let data = (read.request_address..read.request_address + read.size)
                                .map(|address| devices.memory.get(&address).copied().unwrap_or(0))
                                .collect();
                            devices.reads.push(read.clone());
                            Ok(SingleReadMemoryResponse {
                                uri: message.uri,
                                response: Some(ReadMemoryResponse {
                                    request_address: read.request_address,
                                    data,
                                    ..Default::default()
                                }),
                            })
                        })
                        .await
                    }
                    "/DeviceMemory/SingleWrite" => {
                        unary(request, move |message: SingleWriteMemoryRequest| {
                            let write = message.request.unwrap_or_default();
                            let mut devices = lock(&devices);
                            for (address, byte) in (write.request_address..).zip(&write.data) {
                                devices.memory.insert(address, *byte);
                            }
                            Ok(SingleWriteMemoryResponse {
                                uri: message.uri,
                                response: Some(WriteMemoryResponse {
                                    request_address: write.request_address,
                                    size: write.data.len() as u32,
                                    ..Default::default()
                                }),
                            })
                        })
                        .await
                    }
                    "/DeviceFilesystem/ReadDirectory" => {
                        unary(request, move |message: ReadDirectoryRequest| {
                            let entry = |name: &str, kind: DirEntryType| DirEntry {
                                name: name.to_owned(),
                                r#type: kind as i32,
                            };
                            let entries = match message.path.as_str() {
                                "/" => vec![
                                    entry("roms", DirEntryType::Directory),
                                    entry("save.srm", DirEntryType::File),
                                ],
                                "/roms" => vec![entry("game.sfc", DirEntryType::File)],
                                _ => return Err(Status::not_found(message.path.clone())),
                            };
                            Ok(ReadDirectoryResponse {
                                uri: message.uri,
                                path: message.path,
                                entries,
                            })
                        })
                        .await
                    }
                    "/DeviceFilesystem/MakeDirectory" => {
                        unary(request, move |message: PathRequest| {
                            lock(&devices).directories.push(message.path.clone());
                            Ok(message)
                        })
                        .await
                    }
                    _ => http::Response::builder()
                        .header("grpc-status", (Code::Unimplemented as i32).to_string())
                        .header("content-type", "application/grpc")
                        .body(empty_body())
                        .unwrap(),
                };
                Ok(response)
            })
        }
    }

    async fn serve(devices: &Arc<Mutex<FakeDevices>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let incoming = TcpIncoming::from_listener(listener, true, None).unwrap();
        let server = Server::builder()
            .add_service(FakeService::<0>(devices.clone()))
            .add_service(FakeService::<1>(devices.clone()))
            .add_service(FakeService::<2>(devices.clone()))
            .serve_with_incoming(incoming);
        spawn(server);
        address.to_string()
    }

    fn fx_pak(capabilities: &[DeviceCapability]) -> Device {
        Device {
            uri: DEVICE_URI.to_owned(),
            display_name: "FX Pak Pro".to_owned(),
            kind: "fxpakpro".to_owned(),
            capabilities: capabilities.iter().map(|&x| x as i32).collect(),
            ..Default::default()
        }
    }

    async fn next_event(events: &mut broadcast::Receiver<ConnectorEvent>) -> ConnectorEvent {
        timeout(WAIT, events.recv()).await.unwrap().unwrap()
    }

    #[test]
    fn capabilities_follow_the_device() {
        let device = Device {
            capabilities: vec![
                DeviceCapability::ReadMemory as i32,
                DeviceCapability::WriteMemory as i32,
                DeviceCapability::ReadDirectory as i32,
            ],
            ..Default::default()
        };
        let caps = device_capabilities(&device);
        assert!(caps.can_read_memory() && caps.can_read_rom() && caps.can_write_rom());
        assert!(caps.can_access_files());
        assert!(!caps.can_perform_commands());

        assert_eq!(
            device_capabilities(&Device::default()),
            ConnectorCapabilities::none()
        );
    }

    #[test]
    fn only_channel_failures_end_the_session() {
        assert!(is_transport_failure(&Status::unavailable("refused")));
        assert!(is_transport_failure(&Status::deadline_exceeded("slow")));
        assert!(!is_transport_failure(&Status::not_found("no such file")));
        assert!(!is_transport_failure(&Status::unknown("device error")));
    }

    #[tokio::test]
    async fn device_service_serves_memory_and_files() {
        let devices = Arc::new(Mutex::new(FakeDevices::default()));
        let address = serve(&devices).await;
        let connector = RpcDeviceConnector::new();
        let mut events = connector.subscribe();
        connector
            .enable(&ConnectorSettings {
                rpc_address: address,
                ..Default::default()
            })
            .await;
        assert_eq!(connector.state(), ConnectionState::Discovering);

        {
            let mut devices = lock(&devices);
            devices.devices.push(fx_pak(&[
                DeviceCapability::ReadMemory,
                DeviceCapability::WriteMemory,
                DeviceCapability::ReadDirectory,
            ]));
            devices.memory.extend([(0xF50020, 0x34), (0xF50021, 0x12)]);
        }
        assert!(matches!(next_event(&mut events).await, ConnectorEvent::Connected));
        assert!(matches!(next_event(&mut events).await, ConnectorEvent::GameDetected));
        assert!(connector.capabilities().can_access_files());

        connector
            .retrieve_memory(MemoryRequest::retrieve(
                0x7E0020,
                2,
                MemoryDomain::ConsoleRam,
                AddressFormat::LinearOffset,
            ))
            .await;
        match next_event(&mut events).await {
            ConnectorEvent::MemoryReceived { data, .. } => {
                assert_eq!(data.read_u16(0), Some(0x1234))
            }
            event => panic!("unexpected {:?}", event),
        }
        let read = lock(&devices).reads[0].clone();
        assert_eq!(read.request_address, 0xF50020);
        assert_eq!(read.request_address_space, AddressSpace::FxPakPro as i32);
        assert_eq!(read.size, 2);

        connector
            .update_memory(MemoryRequest::update(
                0x7E0100,
                vec![7, 8],
                MemoryDomain::ConsoleRam,
                AddressFormat::LinearOffset,
            ))
            .await;
        assert!(matches!(
            next_event(&mut events).await,
            ConnectorEvent::MemoryUpdated { .. }
        ));
        assert_eq!(lock(&devices).memory.get(&0xF50101), Some(&8));

        connector
            .list_files(FileListRequest::new("/").include_subdirectories())
            .await;
        match next_event(&mut events).await {
            ConnectorEvent::FileListReceived { files, .. } => {
                let mut paths: Vec<_> = files.iter().map(|x| x.full_path().clone()).collect();
                paths.sort();
                assert_eq!(paths, ["/roms", "/roms/game.sfc", "/save.srm"]);
            }
            event => panic!("unexpected {:?}", event),
        }

        connector
            .create_directory(CreateDirectoryRequest::new("/saves"))
            .await;
        match next_event(&mut events).await {
            ConnectorEvent::DirectoryCreated { outcome, .. } => assert_eq!(outcome, Ok(())),
            event => panic!("unexpected {:?}", event),
        }
        assert_eq!(lock(&devices).directories, ["/saves"]);

        // Unknown methods are refused by the device, not by the channel.
        connector.boot_rom(BootRomRequest::new("/roms/game.sfc")).await;
        match next_event(&mut events).await {
            ConnectorEvent::RomBooted { outcome, .. } => {
                assert!(matches!(outcome, Err(FileTransferError::Rejected(_))))
            }
            event => panic!("unexpected {:?}", event),
        }
        assert_eq!(connector.state(), ConnectionState::GameDetected);

        connector.disable().await;
        assert!(matches!(next_event(&mut events).await, ConnectorEvent::Disconnected));
        assert_eq!(connector.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn idle_device_is_detached_and_rediscovered() {
        let devices = Arc::new(Mutex::new(FakeDevices::default()));
        lock(&devices)
            .devices
            .push(fx_pak(&[DeviceCapability::ReadMemory]));
        let address = serve(&devices).await;
        let connector = RpcDeviceConnector::new();
        let mut events = connector.subscribe();
        connector
            .enable(&ConnectorSettings {
                rpc_address: address,
                timeout_seconds: 1,
                ..Default::default()
            })
            .await;
        assert!(matches!(next_event(&mut events).await, ConnectorEvent::Connected));
        assert!(matches!(next_event(&mut events).await, ConnectorEvent::GameDetected));

        assert!(matches!(next_event(&mut events).await, ConnectorEvent::Disconnected));
        assert_eq!(connector.state(), ConnectionState::Discovering);
        assert!(matches!(next_event(&mut events).await, ConnectorEvent::Connected));
        connector.disable().await;
    }

    #[tokio::test]
    async fn malformed_address_ends_discovery() {
        let connector = RpcDeviceConnector::new();
        connector
            .enable(&ConnectorSettings {
                rpc_address: "bad host:8191".to_owned(),
                ..Default::default()
            })
            .await;
        timeout(WAIT, async {
            while connector.state() != ConnectionState::Disconnected {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // A later enable starts over.
        connector.enable(&ConnectorSettings::default()).await;
        assert_eq!(connector.state(), ConnectionState::Discovering);
        connector.disable().await;
    }

    #[tokio::test]
    async fn stale_runs_leave_the_new_session_alone() {
        let connector = RpcDeviceConnector::new();
        let inner = &connector.inner;
        let stale = inner.status.enable().unwrap();
        inner.status.disable();
        let current = inner.status.enable().unwrap();
        *lock(&inner.session) = Some(Session {
            client: DeviceServiceClient::connect_lazy("http://127.0.0.1:1".to_owned(), CALL_DEADLINE)
                .unwrap(),
            uri: DEVICE_URI.to_owned(),
        });
        inner.status.mark_connected(ConnectorCapabilities::memory_only());

        inner.end_session(&stale);
        assert!(inner.session().is_some());
        assert_eq!(inner.status.state(), ConnectionState::Connected);

        inner.end_session(&current);
        assert!(inner.session().is_none());
        assert_eq!(inner.status.state(), ConnectionState::Discovering);
    }

    #[tokio::test]
    async fn file_commands_need_a_session() {
        let connector = RpcDeviceConnector::new();
        let mut events = connector.subscribe();
        connector.delete_file(DeleteFileRequest::new("/a.sfc")).await;
        match events.recv().await.unwrap() {
            ConnectorEvent::FileDeleted { outcome, .. } => {
                assert_eq!(outcome, Err(FileTransferError::Disconnected))
            }
            event => panic!("unexpected {:?}", event),
        }
    }
}
