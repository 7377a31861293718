mod command_program;
mod protocol;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{stream::SplitStream, SinkExt, StreamExt};
use tokio::{
    fs::File,
    io::AsyncReadExt,
    net::TcpStream,
    select, spawn,
    sync::{broadcast, mpsc, oneshot},
    time::{sleep, timeout},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    address::{convert, AddressFormat, MemoryDomain},
    capabilities::ConnectorCapabilities,
    error::FileTransferError,
    request::{
        BootRomRequest, CommandOutcome, CreateDirectoryRequest, DeleteDirectoryRequest,
        DeleteFileRequest, FileListRequest, MemoryRequest, UploadFileRequest,
    },
    settings::ConnectorSettings,
};

use self::{
    command_program::{write_program, COMMAND_ADDRESS, COMMAND_SPACE},
    protocol::{hex, parse_listing, DeviceInfo, Envelope, Opcode, Reply},
};

use super::{
    file_walk::{walk_directory, WalkOrder},
    lock, ConnectionState, ConnectionStatus, Connector, ConnectorEvent, ConnectorType,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const DEVICE_POLL_INTERVAL: Duration = Duration::from_secs(3);
const ROM_POLL_INTERVAL: Duration = Duration::from_secs(2);
const HANDSHAKE_STEP_DELAY: Duration = Duration::from_millis(500);
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(50);
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const PUT_ADDRESS_DELAY: Duration = Duration::from_millis(50);
const UPLOAD_CHUNK_SIZE: usize = 4096;
const LARGE_UPLOAD_SIZE: u64 = 2 * 1024 * 1024;
/// Work RAM byte read once per attach to confirm a game is running.
const CALIBRATION_ADDRESS: u32 = 0x7E0020;

/// Time the device needs to flush an upload; the bridge never acknowledges
/// `PutFile`.
fn upload_settle_delay(size: u64) -> Duration {
    if size > LARGE_UPLOAD_SIZE {
        Duration::from_millis(size / 1024)
    } else {
        Duration::from_secs(1)
    }
}

enum Waiter {
    Text(oneshot::Sender<Vec<String>>),
    Binary {
        expected: usize,
        buffer: Vec<u8>,
        reply: oneshot::Sender<Vec<u8>>,
    },
}

struct Session {
    outgoing: mpsc::Sender<Message>,
    token: CancellationToken,
}

struct Inner {
    status: ConnectionStatus,
    settings: Mutex<ConnectorSettings>,
    session: Mutex<Option<Session>>,
    waiter: Mutex<Option<Waiter>>,
    device: Mutex<Option<DeviceInfo>>,
}

impl Inner {
    async fn run(self: Arc<Self>, token: CancellationToken) {
        loop {
            let url = lock(&self.settings).websocket_url();
            debug!("Connecting to websocket bridge at {}", url);
            let connected = select! {
                _ = token.cancelled() => break,
                result = connect_async(url.as_str()) => result,
            };
            match connected {
                Ok((stream, _)) => {
                    info!("Connected to websocket bridge at {}", url);
                    if let Err(err) = self.clone().run_session(stream, &token).await {
                        warn!("Websocket bridge session ended: {:#}", err);
                    }
                }
                Err(err) => debug!("Unable to reach websocket bridge at {}: {}", url, err),
            }
            self.end_session(&token);
            select! {
                _ = token.cancelled() => break,
                _ = sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    async fn run_session(self: Arc<Self>, stream: WsStream, token: &CancellationToken) -> Result<()> {
        let (mut sink, stream) = stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::channel::<Message>(16);
        let session_token = token.child_token();
        spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                if let Err(err) = sink.send(message).await {
                    debug!("Failed to write to websocket bridge: {}", err);
                    return;
                }
            }
            let _ = sink.close().await;
        });
        {
            let mut session = lock(&self.session);
            if token.is_cancelled() {
                return Ok(());
            }
            *session = Some(Session {
                outgoing,
                token: session_token.clone(),
            });
        }
        spawn(self.clone().read_messages(stream, session_token.clone()));

        let handshake = select! {
            _ = session_token.cancelled() => return Ok(()),
            result = self.handshake() => result,
        };
        if let Err(err) = handshake {
            session_token.cancel();
            return Err(err);
        }
        session_token.cancelled().await;
        Ok(())
    }

    async fn handshake(&self) -> Result<()> {
        let device = loop {
            let devices = self.query(&Envelope::new(Opcode::DeviceList, [""; 0])).await?;
            if let Some(device) = devices.into_iter().next() {
                break device;
            }
            debug!("No devices reported by the websocket bridge");
            sleep(DEVICE_POLL_INTERVAL).await;
        };
        info!("Attaching to {}", device);
        self.send_command(&Envelope::new(Opcode::Attach, [device.as_str()]))
            .await?;
        sleep(HANDSHAKE_STEP_DELAY).await;
        let client_name = lock(&self.settings).client_name.clone();
        self.send_command(&Envelope::new(Opcode::Name, [client_name]))
            .await?;
        sleep(HANDSHAKE_STEP_DELAY).await;

        loop {
            self.wait_until_idle().await;
            let results = self.query(&Envelope::new(Opcode::Info, [""; 0])).await;
            self.status.finish_request();
            let info = DeviceInfo::parse(&device, &results?);
            debug!("Device info: {:?}", info);
            self.status.mark_connected(info.capabilities());
            let has_game = info.has_game();
            *lock(&self.device) = Some(info);
            if has_game {
                break;
            }
            sleep(ROM_POLL_INTERVAL).await;
        }

        self.wait_until_idle().await;
        let calibration = match convert(
            CALIBRATION_ADDRESS,
            MemoryDomain::ConsoleRam,
            AddressFormat::LinearOffset,
            AddressFormat::DeviceAbsolute,
        ) {
            Ok(address) => self.query_bytes(address, 1).await,
            Err(err) => Err(err.into()),
        };
        self.status.finish_request();
        calibration?;
        if let Some(info) = lock(&self.device).as_ref() {
            info!("Game detected: {}", info.rom);
        }
        self.status.mark_game_detected();
        Ok(())
    }

    async fn read_messages(self: Arc<Self>, mut stream: SplitStream<WsStream>, token: CancellationToken) {
        loop {
            let message = select! {
                _ = token.cancelled() => break,
                message = stream.next() => message,
            };
            match message {
                Some(Ok(Message::Text(text))) => self.on_text(text.as_str()),
                Some(Ok(Message::Binary(data))) => self.on_binary(&data),
                Some(Ok(Message::Close(_))) | None => {
                    info!("Websocket bridge closed the connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!("Failed to read from websocket bridge: {}", err);
                    break;
                }
            }
        }
        token.cancel();
    }

    fn on_text(&self, text: &str) {
        let reply = match serde_json::from_str::<Reply>(text) {
            Ok(reply) => reply,
            Err(err) => {
                warn!("Dropped malformed reply {:?}: {}", text, err);
                return;
            }
        };
        let mut waiter = lock(&self.waiter);
        match waiter.take() {
            Some(Waiter::Text(sender)) => {
                let _ = sender.send(reply.results);
            }
            other => {
                *waiter = other;
                warn!("Dropped unexpected reply {:?}", text);
            }
        }
    }

    fn on_binary(&self, data: &[u8]) {
        let mut waiter = lock(&self.waiter);
        match waiter.take() {
            Some(Waiter::Binary {
                expected,
                mut buffer,
                reply,
            }) => {
                buffer.extend_from_slice(data);
                if buffer.len() >= expected {
                    buffer.truncate(expected);
                    let _ = reply.send(buffer);
                } else {
                    *waiter = Some(Waiter::Binary {
                        expected,
                        buffer,
                        reply,
                    });
                }
            }
            other => {
                *waiter = other;
                warn!("Dropped unexpected {} byte binary frame", data.len());
            }
        }
    }

    async fn wait_until_idle(&self) {
        while !self.status.try_begin_request() {
            sleep(IDLE_POLL_INTERVAL).await;
        }
    }

    async fn send(&self, message: Message) -> Result<()> {
        let outgoing = lock(&self.session)
            .as_ref()
            .map(|session| session.outgoing.clone())
            .ok_or_else(|| anyhow!("not connected to the websocket bridge"))?;
        outgoing
            .send(message)
            .await
            .map_err(|_| anyhow!("websocket bridge connection is closed"))
    }

    async fn send_command(&self, envelope: &Envelope) -> Result<()> {
        debug!("Sending {:?}", envelope);
        self.send(Message::text(serde_json::to_string(envelope)?))
            .await
    }

    async fn query(&self, envelope: &Envelope) -> Result<Vec<String>> {
        let (sender, receiver) = oneshot::channel();
        *lock(&self.waiter) = Some(Waiter::Text(sender));
        self.send_command(envelope).await?;
        timeout(REPLY_TIMEOUT, receiver)
            .await
            .with_context(|| format!("no reply to {:?}", envelope.opcode()))?
            .context("websocket bridge connection is closed")
    }

    /// `GetAddress` for a device absolute address.
    async fn query_bytes(&self, address: u32, length: usize) -> Result<Vec<u8>> {
        let (reply, receiver) = oneshot::channel();
        *lock(&self.waiter) = Some(Waiter::Binary {
            expected: length,
            buffer: Vec::with_capacity(length),
            reply,
        });
        self.send_command(&Envelope::new(
            Opcode::GetAddress,
            [hex(address), hex(length as u64)],
        ))
        .await?;
        timeout(REPLY_TIMEOUT, receiver)
            .await
            .with_context(|| format!("no data for {:06X}", address))?
            .context("websocket bridge connection is closed")
    }

    async fn put(&self, envelope: Envelope, data: Vec<u8>) -> Result<()> {
        self.send_command(&envelope).await?;
        sleep(PUT_ADDRESS_DELAY).await;
        self.send(Message::binary(data)).await
    }

    async fn write_memory(&self, request: &MemoryRequest) -> Result<()> {
        let data = request.data().clone().unwrap_or_default().to_vec();
        let command_writes = request.domain() == MemoryDomain::ConsoleRam
            && lock(&self.device)
                .as_ref()
                .is_some_and(|info| info.needs_command_writes());
        if command_writes {
            let program = write_program(request.translated_address(AddressFormat::LinearOffset)?, &data);
            let envelope = Envelope::new(
                Opcode::PutAddress,
                [hex(COMMAND_ADDRESS), hex(program.len() as u64)],
            )
            .in_space(COMMAND_SPACE);
            return self.put(envelope, program).await;
        }
        let address = request.translated_address(AddressFormat::DeviceAbsolute)?;
        let envelope = Envelope::new(
            Opcode::PutAddress,
            [hex(address), hex(data.len() as u64)],
        );
        self.put(envelope, data).await
    }

    async fn list_directory(&self, path: String) -> Result<Vec<(String, bool)>> {
        let results = self.query(&Envelope::new(Opcode::List, [path])).await?;
        Ok(parse_listing(&results))
    }

    async fn upload(&self, request: &UploadFileRequest) -> Result<CommandOutcome> {
        let local_file_error = |err: std::io::Error| FileTransferError::LocalFile {
            path: request.local_path().clone(),
            reason: err.to_string(),
        };
        let mut file = match File::open(request.local_path()).await {
            Ok(file) => file,
            Err(err) => return Ok(Err(local_file_error(err))),
        };
        let size = match file.metadata().await {
            Ok(metadata) => metadata.len(),
            Err(err) => return Ok(Err(local_file_error(err))),
        };
        info!(
            "Uploading {} ({} bytes) to {}",
            request.local_path(),
            size,
            request.target_path()
        );
        self.send_command(&Envelope::new(
            Opcode::PutFile,
            [request.target_path().clone(), hex(size)],
        ))
        .await?;
        let mut buffer = vec![0u8; UPLOAD_CHUNK_SIZE];
        loop {
            let read = match file.read(&mut buffer).await {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) => return Ok(Err(local_file_error(err))),
            };
            self.send(Message::binary(buffer[..read].to_vec())).await?;
        }
        sleep(upload_settle_delay(size)).await;
        self.list_directory("/".to_owned()).await?;
        Ok(Ok(()))
    }

    async fn command(&self, envelope: Envelope) -> CommandOutcome {
        if !self.status.try_begin_request() {
            return Err(FileTransferError::Rejected("a request is already in flight".to_owned()));
        }
        let result = self.send_command(&envelope).await;
        self.status.finish_request();
        result.map_err(|err| {
            self.fail(err);
            FileTransferError::Disconnected
        })
    }

    /// Transport failure: drop the session and let the run loop reconnect.
    fn fail(&self, err: anyhow::Error) {
        error!("Websocket bridge request failed: {:#}", err);
        if let Some(session) = lock(&self.session).as_ref() {
            session.token.cancel();
        }
    }

    /// Tears down the session of the run owning `token`. Once that run is
    /// cancelled, `disable` has closed the session already and a newer run
    /// may own the state.
    fn end_session(&self, token: &CancellationToken) {
        let mut session = lock(&self.session);
        if token.is_cancelled() {
            return;
        }
        if let Some(session) = session.take() {
            session.token.cancel();
        }
        lock(&self.waiter).take();
        lock(&self.device).take();
        self.status.mark_disconnected();
    }

    fn close_session(&self) {
        if let Some(session) = lock(&self.session).take() {
            session.token.cancel();
        }
        lock(&self.waiter).take();
        lock(&self.device).take();
    }
}

/// Client of a usb2snes style WebSocket bridge (QUsb2Snes and compatible).
pub struct WebSocketBridgeConnector {
    inner: Arc<Inner>,
}

impl WebSocketBridgeConnector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                status: ConnectionStatus::new(),
                settings: Mutex::new(ConnectorSettings::default()),
                session: Mutex::new(None),
                waiter: Mutex::new(None),
                device: Mutex::new(None),
            }),
        }
    }
}

impl Default for WebSocketBridgeConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for WebSocketBridgeConnector {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::WebSocketBridge
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
            info!("Enabling websocket bridge connector");
            spawn(self.inner.clone().run(token));
        }
    }

    async fn disable(&self) {
        info!("Disabling websocket bridge connector");
        self.inner.status.disable();
        self.inner.close_session();
    }

    async fn retrieve_memory(&self, request: MemoryRequest) {
        let address = match request.translated_address(AddressFormat::DeviceAbsolute) {
            Ok(address) => address,
            Err(err) => {
                error!("{}", err);
                return;
            }
        };
        if !self.inner.status.try_begin_request() {
            warn!("Websocket bridge is busy, dropped {:?}", request);
            return;
        }
        let result = self.inner.query_bytes(address, request.length()).await;
        self.inner.status.finish_request();
        match result {
            Ok(data) => self.inner.status.emit(ConnectorEvent::MemoryReceived {
                data: request.to_block(data),
                request,
            }),
            Err(err) => self.inner.fail(err),
        }
    }

    async fn update_memory(&self, request: MemoryRequest) {
        if !self.inner.status.try_begin_request() {
            warn!("Websocket bridge is busy, dropped {:?}", request);
            return;
        }
        let result = self.inner.write_memory(&request).await;
        self.inner.status.finish_request();
        match result {
            Ok(()) => self
                .inner
                .status
                .emit(ConnectorEvent::MemoryUpdated { request }),
            Err(err) => self.inner.fail(err),
        }
    }

    async fn list_files(&self, request: FileListRequest) {
        if !self.inner.status.try_begin_request() {
            warn!("Websocket bridge is busy, dropped {:?}", request);
            return;
        }
        let inner = &self.inner;
        let result = walk_directory(&request, WalkOrder::BreadthFirst, |path| {
            inner.list_directory(path)
        })
        .await;
        self.inner.status.finish_request();
        match result {
            Ok(files) => self
                .inner
                .status
                .emit(ConnectorEvent::FileListReceived { request, files }),
            Err(err) => self.inner.fail(err),
        }
    }

    async fn boot_rom(&self, request: BootRomRequest) {
        let outcome = self
            .inner
            .command(Envelope::new(Opcode::Boot, [request.path().as_str()]))
            .await;
        self.inner
            .status
            .emit(ConnectorEvent::RomBooted { request, outcome });
    }

    async fn upload_file(&self, request: UploadFileRequest) {
        if !self.inner.status.try_begin_request() {
            warn!("Websocket bridge is busy, dropped {:?}", request);
            return;
        }
        let result = self.inner.upload(&request).await;
        self.inner.status.finish_request();
        let outcome = result.unwrap_or_else(|err| {
            self.inner.fail(err);
            Err(FileTransferError::Disconnected)
        });
        if let Err(err) = &outcome {
            warn!("Upload of {} failed: {}", request.local_path(), err);
        }
        self.inner
            .status
            .emit(ConnectorEvent::FileUploaded { request, outcome });
    }

    async fn delete_file(&self, request: DeleteFileRequest) {
        let outcome = self
            .inner
            .command(Envelope::new(Opcode::Remove, [request.path().as_str()]))
            .await;
        self.inner
            .status
            .emit(ConnectorEvent::FileDeleted { request, outcome });
    }

    async fn create_directory(&self, request: CreateDirectoryRequest) {
        let outcome = self
            .inner
            .command(Envelope::new(Opcode::MakeDir, [request.path().as_str()]))
            .await;
        self.inner
            .status
            .emit(ConnectorEvent::DirectoryCreated { request, outcome });
    }

    async fn delete_directory(&self, request: DeleteDirectoryRequest) {
        let outcome = self
            .inner
            .command(Envelope::new(Opcode::Remove, [request.path().as_str()]))
            .await;
        self.inner
            .status
            .emit(ConnectorEvent::DirectoryDeleted { request, outcome });
    }
}
