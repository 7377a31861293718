mod recurring;
mod responses;

use std::{
    collections::{HashMap, VecDeque},
    mem,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tokio::{
    select, spawn,
    sync::{
        broadcast::{self, error::RecvError},
        oneshot,
    },
    task::JoinHandle,
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    capabilities::ConnectorCapabilities,
    connector::{
        lock, rpc_device::RpcDeviceConnector, script_bridge::ScriptBridgeConnector,
        script_bridge::ScriptDialectKind, websocket_bridge::WebSocketBridgeConnector, Connector,
        ConnectorEvent, ConnectorType,
    },
    error::{AddressConversionError, FileTransferError},
    memory_block::MemoryBlock,
    request::{
        BootRomRequest, Callback, CommandOutcome, CreateDirectoryRequest, DeleteDirectoryRequest,
        DeleteFileRequest, FileListRequest, Fingerprint, MemoryRequest, RecurringMemoryRequest,
        Request, UploadFileRequest,
    },
    settings::ConnectorSettings,
};

use self::{recurring::RecurringTable, responses::completion};

pub use self::responses::{CommandResponse, FileListResponse, MemoryResponse};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const EVENT_CAPACITY: usize = 16;

/// Handle of a recurring memory subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Lifecycle of the active connector, as seen by the service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceEvent {
    Connected(ConnectorType),
    GameDetected(ConnectorType),
    Disconnected(ConnectorType),
}

#[derive(Default)]
struct ServiceState {
    active: Option<ConnectorType>,
    connected: bool,
    queue: VecDeque<Request>,
    recurring: RecurringTable,
    listener: Option<JoinHandle<()>>,
    poll_token: Option<CancellationToken>,
}

struct Shared {
    connectors: HashMap<ConnectorType, Arc<dyn Connector>>,
    state: Mutex<ServiceState>,
    events: broadcast::Sender<ServiceEvent>,
}

impl Shared {
    fn active_connector(&self) -> Option<Arc<dyn Connector>> {
        let active = lock(&self.state).active?;
        self.connectors.get(&active).cloned()
    }

    fn emit(&self, event: ServiceEvent) {
        let _ = self.events.send(event);
    }

    async fn listen(
        self: Arc<Self>,
        connector: Arc<dyn Connector>,
        mut events: broadcast::Receiver<ConnectorEvent>,
    ) {
        let connector_type = connector.connector_type();
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(count)) => {
                    warn!("Missed {} events from the {:?} connector", count, connector_type);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match event {
                ConnectorEvent::Connected => {
                    info!("Connected with the {:?} connector", connector_type);
                    self.start_polling(connector.clone());
                    self.emit(ServiceEvent::Connected(connector_type));
                }
                ConnectorEvent::GameDetected => {
                    info!("Game detected by the {:?} connector", connector_type);
                    self.emit(ServiceEvent::GameDetected(connector_type));
                }
                ConnectorEvent::Disconnected => {
                    info!("Disconnected from the {:?} connector", connector_type);
                    if self.stop_polling() {
                        self.emit(ServiceEvent::Disconnected(connector_type));
                    }
                }
                ConnectorEvent::MemoryReceived { request, data } => {
                    self.on_memory(&request, data);
                }
                ConnectorEvent::MemoryUpdated { request } => {
                    if let Some(callback) = request.callback() {
                        let data = request.data().clone().unwrap_or_default();
                        callback.call(request.to_block(data));
                    }
                }
                ConnectorEvent::FileListReceived { request, files } => {
                    debug!("Listed {} entries under {}", files.len(), request.path());
                    if let Some(callback) = request.callback() {
                        callback.call(files);
                    }
                }
                ConnectorEvent::RomBooted { request, outcome } => {
                    complete(request.callback(), outcome)
                }
                ConnectorEvent::FileUploaded { request, outcome } => {
                    complete(request.callback(), outcome)
                }
                ConnectorEvent::FileDeleted { request, outcome } => {
                    complete(request.callback(), outcome)
                }
                ConnectorEvent::DirectoryCreated { request, outcome } => {
                    complete(request.callback(), outcome)
                }
                ConnectorEvent::DirectoryDeleted { request, outcome } => {
                    complete(request.callback(), outcome)
                }
            }
        }
    }

    fn on_memory(&self, request: &MemoryRequest, data: MemoryBlock) {
        let Some(fingerprint) = request.group() else {
            if let Some(callback) = request.callback() {
                callback.call(data);
            }
            return;
        };
        let now = Instant::now();
        let filters = lock(&self.state).recurring.due_filters(fingerprint, now);
        let held: Vec<_> = filters
            .into_iter()
            .filter(|(_, filter)| !filter.passes())
            .map(|(id, _)| id)
            .collect();
        let deliveries =
            lock(&self.state)
                .recurring
                .record_response(fingerprint, &data, now, &held);
        for (callback, data) in deliveries {
            callback.call(data);
        }
    }

    fn start_polling(self: &Arc<Self>, connector: Arc<dyn Connector>) {
        let token = CancellationToken::new();
        {
            let mut state = lock(&self.state);
            if let Some(previous) = state.poll_token.replace(token.clone()) {
                previous.cancel();
            }
            state.connected = true;
        }
        spawn(self.clone().poll(connector, token));
    }

    /// Returns whether the service still considered itself connected.
    fn stop_polling(&self) -> bool {
        let (was_connected, token, abandoned) = {
            let mut state = lock(&self.state);
            (
                mem::replace(&mut state.connected, false),
                state.poll_token.take(),
                mem::take(&mut state.queue),
            )
        };
        if let Some(token) = token {
            token.cancel();
        }
        abandon_all(abandoned, FileTransferError::Disconnected);
        was_connected
    }

    async fn poll(self: Arc<Self>, connector: Arc<dyn Connector>, token: CancellationToken) {
        debug!("Polling the {:?} connector", connector.connector_type());
        loop {
            select! {
                _ = token.cancelled() => break,
                _ = sleep(POLL_INTERVAL) => {}
            }
            if connector.can_process_requests() {
                self.poll_once(connector.as_ref()).await;
            }
        }
        debug!("Stopped polling the {:?} connector", connector.connector_type());
    }

    /// Issues at most one request: the head of the one-shot queue when there
    /// is one, otherwise the most overdue recurring group.
    async fn poll_once(&self, connector: &dyn Connector) {
        let capabilities = connector.capabilities();
        let mut abandoned = vec![];
        let (queued, waiting, candidates) = {
            let mut state = lock(&self.state);
            let mut queued = None;
            while let Some(head) = state.queue.front() {
                if !capabilities.supports(head.required_capability()) {
                    abandoned.extend(state.queue.pop_front());
                    continue;
                }
                if connector.can_make_request(head) {
                    queued = state.queue.pop_front();
                }
                break;
            }
            let waiting = !state.queue.is_empty();
            (
                queued,
                waiting,
                state.recurring.candidates(Instant::now()),
            )
        };
        abandon_all(abandoned, FileTransferError::Unsupported);

        if let Some(request) = queued {
            debug!("Issuing {:?}", request);
            connector.execute(request).await;
            return;
        }
        if waiting {
            return;
        }
        let next = candidates
            .into_iter()
            .filter(|candidate| {
                connector.can_make_request(&Request::RetrieveMemory(candidate.request.clone()))
                    && candidate.passes_filter()
            })
            .min_by_key(|candidate| candidate.next_run);
        if let Some(candidate) = next {
            connector.retrieve_memory(candidate.request).await;
        }
    }
}

fn complete(callback: &Option<Callback<CommandOutcome>>, outcome: CommandOutcome) {
    if let Err(err) = &outcome {
        warn!("Request failed: {}", err);
    }
    if let Some(callback) = callback {
        callback.call(outcome);
    }
}

/// Completes requests that will never be issued. Memory reads and listings
/// have no failure value; dropping them resolves their futures as failed.
fn abandon_all(requests: impl IntoIterator<Item = Request>, error: FileTransferError) {
    for request in requests {
        debug!("Abandoned {:?}: {}", request, error);
        match request {
            Request::RetrieveMemory(_) | Request::UpdateMemory(_) | Request::ListFiles(_) => {}
            Request::BootRom(request) => complete(request.callback(), Err(error.clone())),
            Request::UploadFile(request) => complete(request.callback(), Err(error.clone())),
            Request::DeleteFile(request) => complete(request.callback(), Err(error.clone())),
            Request::CreateDirectory(request) => complete(request.callback(), Err(error.clone())),
            Request::DeleteDirectory(request) => complete(request.callback(), Err(error.clone())),
        }
    }
}

/// Front door of the library: owns every connector, arms one at a time and
/// serializes all traffic to it.
pub struct ConnectorService {
    shared: Arc<Shared>,
}

impl ConnectorService {
    pub fn new(connectors: impl IntoIterator<Item = Arc<dyn Connector>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                connectors: connectors
                    .into_iter()
                    .map(|connector| (connector.connector_type(), connector))
                    .collect(),
                state: Mutex::new(ServiceState::default()),
                events: broadcast::channel(EVENT_CAPACITY).0,
            }),
        }
    }

    pub fn with_default_connectors() -> Self {
        let connectors: [Arc<dyn Connector>; 6] = [
            Arc::new(WebSocketBridgeConnector::new()),
            Arc::new(RpcDeviceConnector::new()),
            Arc::new(ScriptBridgeConnector::new(ScriptDialectKind::Default)),
            Arc::new(ScriptBridgeConnector::new(ScriptDialectKind::EmoTracker)),
            Arc::new(ScriptBridgeConnector::new(ScriptDialectKind::EmoTrackerVariant)),
            Arc::new(ScriptBridgeConnector::new(ScriptDialectKind::Pipe)),
        ];
        Self::new(connectors)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.shared.events.subscribe()
    }

    pub async fn connect(&self, settings: &ConnectorSettings) {
        let connector_type = settings.connector_type;
        let Some(connector) = self.shared.connectors.get(&connector_type).cloned() else {
            error!("No connector registered for {:?}", connector_type);
            return;
        };
        let already_connected =
            lock(&self.shared.state).active == Some(connector_type) && connector.is_connected();
        if already_connected {
            debug!("Already connected with the {:?} connector", connector_type);
            return;
        }
        self.disconnect().await;

        info!("Connecting with the {:?} connector", connector_type);
        let events = connector.subscribe();
        let listener = spawn(self.shared.clone().listen(connector.clone(), events));
        {
            let mut state = lock(&self.shared.state);
            state.active = Some(connector_type);
            state.listener = Some(listener);
        }
        connector.enable(settings).await;
    }

    pub async fn connect_type(&self, connector_type: ConnectorType) {
        self.connect(&ConnectorSettings::for_type(connector_type))
            .await;
    }

    pub async fn disconnect(&self) {
        let (connector_type, listener, token, was_connected, abandoned) = {
            let mut state = lock(&self.shared.state);
            (
                state.active.take(),
                state.listener.take(),
                state.poll_token.take(),
                mem::replace(&mut state.connected, false),
                mem::take(&mut state.queue),
            )
        };
        let Some(connector_type) = connector_type else {
            return;
        };
        if let Some(listener) = listener {
            listener.abort();
        }
        if let Some(token) = token {
            token.cancel();
        }
        info!("Disconnecting from the {:?} connector", connector_type);
        if let Some(connector) = self.shared.connectors.get(&connector_type) {
            connector.disable().await;
        }
        abandon_all(abandoned, FileTransferError::Disconnected);
        if was_connected {
            self.shared
                .emit(ServiceEvent::Disconnected(connector_type));
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared
            .active_connector()
            .is_some_and(|connector| connector.is_connected())
    }

    pub fn is_game_detected(&self) -> bool {
        self.shared
            .active_connector()
            .is_some_and(|connector| connector.is_game_detected())
    }

    /// The armed connector, connected or not.
    pub fn connector_type(&self) -> Option<ConnectorType> {
        lock(&self.shared.state).active
    }

    pub fn capabilities(&self) -> ConnectorCapabilities {
        self.shared
            .active_connector()
            .map_or(ConnectorCapabilities::none(), |connector| {
                connector.capabilities()
            })
    }

    pub fn can_make_request(&self, request: &Request) -> bool {
        self.shared
            .active_connector()
            .is_some_and(|connector| connector.can_make_request(request))
    }

    /// Queues a one-shot request. Returns `false` when nothing is connected
    /// or the connector cannot serve this kind of request.
    fn enqueue(&self, request: Request) -> bool {
        let Some(connector) = self.shared.active_connector() else {
            warn!("Not connected, dropped {:?}", request);
            return false;
        };
        if !connector.is_connected() {
            warn!("Not connected, dropped {:?}", request);
            return false;
        }
        let required = request.required_capability();
        if !connector.capabilities().supports(required) {
            warn!(
                "The {:?} connector cannot {:?}, dropped {:?}",
                connector.connector_type(),
                required,
                request
            );
            return false;
        }
        if let Request::RetrieveMemory(memory) | Request::UpdateMemory(memory) = &request {
            if let Err(err) = Fingerprint::of(memory) {
                error!("{}", err);
                return false;
            }
        }
        lock(&self.shared.state).queue.push_back(request);
        true
    }

    pub fn make_memory_request(&self, request: MemoryRequest) -> bool {
        self.enqueue(request.into())
    }

    pub async fn make_memory_request_async(&self, mut request: MemoryRequest) -> MemoryResponse {
        let (callback, receiver) = completion(request.callback().clone());
        request.set_callback(Some(callback));
        if !self.make_memory_request(request) {
            return MemoryResponse::default();
        }
        match receiver.await {
            Ok(data) => MemoryResponse {
                successful: true,
                data: Some(data),
            },
            Err(_) => MemoryResponse::default(),
        }
    }

    pub fn add_recurring_memory_request(
        &self,
        request: RecurringMemoryRequest,
    ) -> Result<SubscriptionId, AddressConversionError> {
        let mut state = lock(&self.shared.state);
        let id = state.recurring.insert(request)?;
        debug!("Added {:?}, {} subscriptions", id, state.recurring.len());
        Ok(id)
    }

    pub fn remove_recurring_memory_request(&self, id: SubscriptionId) -> bool {
        lock(&self.shared.state).recurring.remove(id)
    }

    pub fn clear_recurring_memory_requests(&self) {
        lock(&self.shared.state).recurring.clear();
    }

    pub fn get_file_list(&self, request: FileListRequest) -> bool {
        self.enqueue(Request::ListFiles(request))
    }

    pub async fn get_file_list_async(&self, mut request: FileListRequest) -> FileListResponse {
        let (callback, receiver) = completion(request.callback().clone());
        request.set_callback(Some(callback));
        if !self.get_file_list(request) {
            return FileListResponse::default();
        }
        match receiver.await {
            Ok(files) => FileListResponse {
                successful: true,
                files,
            },
            Err(_) => FileListResponse::default(),
        }
    }

    pub fn boot_rom(&self, request: BootRomRequest) -> bool {
        self.enqueue(Request::BootRom(request))
    }

    pub async fn boot_rom_async(&self, mut request: BootRomRequest) -> CommandResponse {
        let (callback, receiver) = completion(request.callback().clone());
        request.set_callback(Some(callback));
        let queued = self.boot_rom(request);
        command_response(queued, receiver).await
    }

    pub fn upload_file(&self, request: UploadFileRequest) -> bool {
        self.enqueue(Request::UploadFile(request))
    }

    pub async fn upload_file_async(&self, mut request: UploadFileRequest) -> CommandResponse {
        let (callback, receiver) = completion(request.callback().clone());
        request.set_callback(Some(callback));
        let queued = self.upload_file(request);
        command_response(queued, receiver).await
    }

    pub fn delete_file(&self, request: DeleteFileRequest) -> bool {
        self.enqueue(Request::DeleteFile(request))
    }

    pub async fn delete_file_async(&self, mut request: DeleteFileRequest) -> CommandResponse {
        let (callback, receiver) = completion(request.callback().clone());
        request.set_callback(Some(callback));
        let queued = self.delete_file(request);
        command_response(queued, receiver).await
    }

    pub fn create_directory(&self, request: CreateDirectoryRequest) -> bool {
        self.enqueue(Request::CreateDirectory(request))
    }

    pub async fn create_directory_async(&self, mut request: CreateDirectoryRequest) -> CommandResponse {
        let (callback, receiver) = completion(request.callback().clone());
        request.set_callback(Some(callback));
        let queued = self.create_directory(request);
        command_response(queued, receiver).await
    }

    pub fn delete_directory(&self, request: DeleteDirectoryRequest) -> bool {
        self.enqueue(Request::DeleteDirectory(request))
    }

    pub async fn delete_directory_async(&self, mut request: DeleteDirectoryRequest) -> CommandResponse {
        let (callback, receiver) = completion(request.callback().clone());
        request.set_callback(Some(callback));
        let queued = self.delete_directory(request);
        command_response(queued, receiver).await
    }
}

impl Default for ConnectorService {
    fn default() -> Self {
        Self::with_default_connectors()
    }
}

async fn command_response(
    queued: bool,
    receiver: oneshot::Receiver<CommandOutcome>,
) -> CommandResponse {
    if !queued {
        return CommandResponse {
            successful: false,
            error: Some(FileTransferError::Unsupported),
        };
    }
    match receiver.await {
        Ok(outcome) => outcome.into(),
        Err(_) => CommandResponse {
            successful: false,
            error: Some(FileTransferError::Disconnected),
        },
    }
}
