mod default_dialect;
mod emo_tracker;
mod framing;
mod pipe;

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    select, spawn,
    sync::{broadcast, mpsc},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    address::{AddressFormat, MemoryDomain},
    capabilities::ConnectorCapabilities,
    error::FileTransferError,
    request::{
        BootRomRequest, CreateDirectoryRequest, DeleteDirectoryRequest, DeleteFileRequest,
        FileListRequest, MemoryRequest, Request, UploadFileRequest,
    },
    settings::ConnectorSettings,
};

use self::{
    default_dialect::DefaultDialect,
    emo_tracker::EmoTrackerDialect,
    framing::{FrameDecoder, Framing},
    pipe::PipeDialect,
};

use super::{lock, ConnectionState, ConnectionStatus, Connector, ConnectorEvent, ConnectorType};

const SILENCE_LIMIT: Duration = Duration::from_secs(5);
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);
const ACCEPT_COOLDOWN: Duration = Duration::from_secs(1);
const BIND_RETRY_DELAY: Duration = Duration::from_secs(3);
const READ_BUFFER_SIZE: usize = 4096;

/// Wire dialect spoken by the companion script.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum ScriptDialectKind {
    #[default]
    Default,
    EmoTracker,
    /// EmoTracker framing on another port with a slower start.
    EmoTrackerVariant,
    Pipe,
}

impl ScriptDialectKind {
    pub fn connector_type(self) -> ConnectorType {
        match self {
            ScriptDialectKind::Default => ConnectorType::ScriptBridge,
            ScriptDialectKind::EmoTracker => ConnectorType::ScriptBridgeEmoTracker,
            ScriptDialectKind::EmoTrackerVariant => ConnectorType::ScriptBridgeEmoTrackerVariant,
            ScriptDialectKind::Pipe => ConnectorType::ScriptBridgePipe,
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            ScriptDialectKind::Default => 21562,
            ScriptDialectKind::EmoTracker => 43884,
            ScriptDialectKind::EmoTrackerVariant => 23884,
            ScriptDialectKind::Pipe => 65398,
        }
    }

    /// Pause between accepting a socket and sending the version probe.
    pub fn probe_delay(self) -> Duration {
        match self {
            ScriptDialectKind::Default => Duration::ZERO,
            ScriptDialectKind::EmoTracker => Duration::from_millis(500),
            ScriptDialectKind::EmoTrackerVariant | ScriptDialectKind::Pipe => {
                Duration::from_secs(1)
            }
        }
    }

    fn dialect(self) -> Box<dyn ScriptDialect> {
        match self {
            ScriptDialectKind::Default => Box::new(DefaultDialect),
            ScriptDialectKind::EmoTracker | ScriptDialectKind::EmoTrackerVariant => {
                Box::new(EmoTrackerDialect)
            }
            ScriptDialectKind::Pipe => Box::new(PipeDialect),
        }
    }
}

fn domain_name(domain: MemoryDomain) -> &'static str {
    match domain {
        MemoryDomain::ConsoleRam => "WRAM",
        MemoryDomain::CartridgeSave => "CARTRAM",
        MemoryDomain::Rom => "CARTROM",
    }
}

/// A memory access already translated to the peer's addressing.
#[derive(Clone, Copy, Debug)]
struct Target {
    address: u32,
    length: usize,
    domain: MemoryDomain,
    zero_based: bool,
}

#[derive(Debug)]
enum Reply {
    Version { zero_based: bool, peer: String },
    Memory(Vec<u8>),
    Ignored,
}

/// Encoding strategy of one dialect. Outbound messages are returned fully
/// framed.
trait ScriptDialect: Send + Sync {
    fn framing(&self) -> Framing;
    fn probe(&self) -> Result<Vec<Vec<u8>>>;
    fn read(&self, target: &Target) -> Result<Vec<u8>>;
    fn write(&self, target: &Target, data: &[u8]) -> Result<Vec<Vec<u8>>>;
    fn parse(&self, frame: &str) -> Result<Reply>;
}

struct Peer {
    outgoing: mpsc::Sender<Vec<u8>>,
    token: CancellationToken,
    /// Fixed by the version reply for the rest of the session.
    zero_based: bool,
}

struct Inner {
    kind: ScriptDialectKind,
    dialect: Box<dyn ScriptDialect>,
    status: ConnectionStatus,
    settings: Mutex<ConnectorSettings>,
    local_addr: Mutex<Option<SocketAddr>>,
    peer: Mutex<Option<Peer>>,
    pending: Mutex<Option<MemoryRequest>>,
    last_message: Mutex<Instant>,
}

impl Inner {
    async fn run(self: Arc<Self>, token: CancellationToken) {
        let address = match lock(&self.settings).script_socket_address(self.kind.default_port()) {
            Ok(address) => address,
            Err(err) => {
                error!("Invalid companion script address: {}", err);
                self.status.give_up(&token);
                return;
            }
        };
        let listener = loop {
            match TcpListener::bind(address).await {
                Ok(listener) => break listener,
                Err(err) => warn!("Unable to listen on {}: {}", address, err),
            }
            select! {
                _ = token.cancelled() => return,
                _ = sleep(BIND_RETRY_DELAY) => {}
            }
        };
        let local_addr = listener.local_addr().ok();
        info!(
            "Waiting for {:?} companion script on {}",
            self.kind,
            local_addr.unwrap_or(address)
        );
        *lock(&self.local_addr) = local_addr;
        spawn(self.clone().watchdog(token.clone()));

        loop {
            let accepted = select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer_addr)) => {
                    info!("Accepted companion script connection from {}", peer_addr);
                    self.clone().serve(stream, &token).await;
                    self.end_session(&token);
                }
                Err(err) => warn!("Failed to accept companion script: {}", err),
            }
            select! {
                _ = token.cancelled() => break,
                _ = sleep(ACCEPT_COOLDOWN) => {}
            }
        }
    }

    async fn serve(self: Arc<Self>, stream: TcpStream, token: &CancellationToken) {
        let (mut reader, mut writer) = stream.into_split();
        let (outgoing, mut outgoing_rx) = mpsc::channel::<Vec<u8>>(16);
        let session_token = token.child_token();
        spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                if let Err(err) = writer.write_all(&message).await {
                    debug!("Failed to write to companion script: {}", err);
                    return;
                }
            }
        });
        {
            let mut peer = lock(&self.peer);
            if token.is_cancelled() {
                return;
            }
            *peer = Some(Peer {
                outgoing: outgoing.clone(),
                token: session_token.clone(),
                zero_based: false,
            });
        }
        self.touch();

        let probe = match self.dialect.probe() {
            Ok(probe) => probe,
            Err(err) => {
                error!("Failed to encode version probe: {:#}", err);
                return;
            }
        };
        let delay = self.kind.probe_delay();
        let probe_token = session_token.clone();
        spawn(async move {
            select! {
                _ = probe_token.cancelled() => return,
                _ = sleep(delay) => {}
            }
            for message in probe {
                if outgoing.send(message).await.is_err() {
                    return;
                }
            }
        });

        let mut decoder = FrameDecoder::new(self.dialect.framing());
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let read = select! {
                _ = session_token.cancelled() => break,
                read = reader.read(&mut buffer) => read,
            };
            match read {
                Ok(0) => {
                    info!("Companion script closed the connection");
                    break;
                }
                Ok(read) => {
                    self.touch();
                    decoder.push(&buffer[..read]);
                    while let Some(frame) = decoder.next_frame() {
                        self.on_frame(&frame);
                    }
                }
                Err(err) => {
                    warn!("Failed to read from companion script: {}", err);
                    break;
                }
            }
        }
    }

    fn on_frame(&self, frame: &str) {
        let reply = match self.dialect.parse(frame) {
            Ok(reply) => reply,
            Err(err) => {
                warn!("Dropped malformed message {:?}: {:#}", frame, err);
                return;
            }
        };
        match reply {
            Reply::Version { zero_based, peer } => {
                info!(
                    "Companion script reports {:?} ({} addressing)",
                    peer,
                    if zero_based { "zero-based" } else { "bus" }
                );
                if let Some(session) = lock(&self.peer).as_mut() {
                    session.zero_based = zero_based;
                }
                self.status.mark_connected(ConnectorCapabilities::memory_only());
                self.status.mark_game_detected();
            }
            Reply::Memory(bytes) => {
                let pending = lock(&self.pending).take();
                self.status.finish_request();
                match pending {
                    Some(request) => self.status.emit(ConnectorEvent::MemoryReceived {
                        data: request.to_block(bytes),
                        request,
                    }),
                    None => warn!("Dropped unsolicited {} byte memory reply", bytes.len()),
                }
            }
            Reply::Ignored => debug!("Ignored message {:?}", frame),
        }
    }

    async fn watchdog(self: Arc<Self>, token: CancellationToken) {
        loop {
            select! {
                _ = token.cancelled() => break,
                _ = sleep(WATCHDOG_INTERVAL) => {}
            }
            let silent = lock(&self.last_message).elapsed() > SILENCE_LIMIT;
            if !silent {
                continue;
            }
            if let Some(peer) = lock(&self.peer).as_ref() {
                if !peer.token.is_cancelled() {
                    warn!("Companion script silent for {:?}, dropping it", SILENCE_LIMIT);
                    peer.token.cancel();
                }
            }
        }
    }

    fn touch(&self) {
        *lock(&self.last_message) = Instant::now();
    }

    fn peer_handle(&self) -> Option<(mpsc::Sender<Vec<u8>>, bool)> {
        lock(&self.peer)
            .as_ref()
            .map(|peer| (peer.outgoing.clone(), peer.zero_based))
    }

    fn target(&self, request: &MemoryRequest, zero_based: bool) -> Result<Target> {
        let format = if zero_based {
            AddressFormat::ZeroBased
        } else {
            AddressFormat::LinearOffset
        };
        Ok(Target {
            address: request.translated_address(format)?,
            length: request.length(),
            domain: request.domain(),
            zero_based,
        })
    }

    /// Drops the peer served by the run owning `token`. Once that run is
    /// cancelled, `disable` has torn everything down already and a newer run
    /// may own the state.
    fn end_session(&self, token: &CancellationToken) {
        let mut peer = lock(&self.peer);
        if token.is_cancelled() {
            return;
        }
        if let Some(peer) = peer.take() {
            peer.token.cancel();
        }
        lock(&self.pending).take();
        self.status.mark_disconnected();
    }

    /// Ends the current peer's session; its run loop does the teardown.
    fn cancel_peer(&self) {
        if let Some(peer) = lock(&self.peer).as_ref() {
            peer.token.cancel();
        }
    }

    fn close(&self) {
        if let Some(peer) = lock(&self.peer).take() {
            peer.token.cancel();
        }
        lock(&self.pending).take();
        lock(&self.local_addr).take();
    }
}

/// Listens for a companion script running inside an emulator and talks to it
/// in one of several dialects.
pub struct ScriptBridgeConnector {
    inner: Arc<Inner>,
}

impl ScriptBridgeConnector {
    pub fn new(kind: ScriptDialectKind) -> Self {
        Self {
            inner: Arc::new(Inner {
                kind,
                dialect: kind.dialect(),
                status: ConnectionStatus::new(),
                settings: Mutex::new(ConnectorSettings::for_type(kind.connector_type())),
                local_addr: Mutex::new(None),
                peer: Mutex::new(None),
                pending: Mutex::new(None),
                last_message: Mutex::new(Instant::now()),
            }),
        }
    }

    pub fn kind(&self) -> ScriptDialectKind {
        self.inner.kind
    }

    /// Address the listener is bound to while enabled.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.inner.local_addr)
    }

    fn reject(&self, request: Request) {
        self.inner
            .status
            .reject(request, FileTransferError::Unsupported);
    }
}

impl Default for ScriptBridgeConnector {
    fn default() -> Self {
        Self::new(ScriptDialectKind::default())
    }
}

#[async_trait]
impl Connector for ScriptBridgeConnector {
    fn connector_type(&self) -> ConnectorType {
        self.inner.kind.connector_type()
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
            info!("Enabling {:?} script bridge connector", self.inner.kind);
            spawn(self.inner.clone().run(token));
        }
    }

    async fn disable(&self) {
        info!("Disabling {:?} script bridge connector", self.inner.kind);
        self.inner.status.disable();
        self.inner.close();
    }

    async fn retrieve_memory(&self, request: MemoryRequest) {
        let Some((outgoing, zero_based)) = self.inner.peer_handle() else {
            warn!("No companion script connected, dropped {:?}", request);
            return;
        };
        let message = match self
            .inner
            .target(&request, zero_based)
            .and_then(|target| self.inner.dialect.read(&target))
        {
            Ok(message) => message,
            Err(err) => {
                error!("Unable to encode {:?}: {:#}", request, err);
                return;
            }
        };
        if !self.inner.status.try_begin_request() {
            warn!("Companion script is busy, dropped {:?}", request);
            return;
        }
        debug!("Requesting {} bytes at {:06X}", request.length(), request.address());
        *lock(&self.inner.pending) = Some(request);
        if outgoing.send(message).await.is_err() {
            warn!("Companion script connection is closed");
            self.inner.cancel_peer();
        }
    }

    async fn update_memory(&self, request: MemoryRequest) {
        let Some((outgoing, zero_based)) = self.inner.peer_handle() else {
            warn!("No companion script connected, dropped {:?}", request);
            return;
        };
        let data = request.data().clone().unwrap_or_default();
        let messages = match self
            .inner
            .target(&request, zero_based)
            .and_then(|target| self.inner.dialect.write(&target, &data))
        {
            Ok(messages) => messages,
            Err(err) => {
                error!("Unable to encode {:?}: {:#}", request, err);
                return;
            }
        };
        if !self.inner.status.try_begin_request() {
            warn!("Companion script is busy, dropped {:?}", request);
            return;
        }
        for message in messages {
            if outgoing.send(message).await.is_err() {
                warn!("Companion script connection is closed");
                self.inner.cancel_peer();
                return;
            }
        }
        self.inner.status.finish_request();
        self.inner
            .status
            .emit(ConnectorEvent::MemoryUpdated { request });
    }

    async fn list_files(&self, request: FileListRequest) {
        self.reject(Request::ListFiles(request));
    }

    async fn boot_rom(&self, request: BootRomRequest) {
        self.reject(Request::BootRom(request));
    }

    async fn upload_file(&self, request: UploadFileRequest) {
        self.reject(Request::UploadFile(request));
    }

    async fn delete_file(&self, request: DeleteFileRequest) {
        self.reject(Request::DeleteFile(request));
    }

    async fn create_directory(&self, request: CreateDirectoryRequest) {
        self.reject(Request::CreateDirectory(request));
    }

    async fn delete_directory(&self, request: DeleteDirectoryRequest) {
        self.reject(Request::DeleteDirectory(request));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialects_map_to_connector_types() {
        for kind in [
            ScriptDialectKind::Default,
            ScriptDialectKind::EmoTracker,
            ScriptDialectKind::EmoTrackerVariant,
            ScriptDialectKind::Pipe,
        ] {
            let connector = ScriptBridgeConnector::new(kind);
            assert_eq!(connector.connector_type(), kind.connector_type());
            assert_eq!(connector.state(), ConnectionState::Disconnected);
        }
        assert_eq!(ScriptDialectKind::EmoTrackerVariant.default_port(), 23884);
        assert!(
            ScriptDialectKind::EmoTrackerVariant.probe_delay()
                > ScriptDialectKind::EmoTracker.probe_delay()
        );
    }

    #[test]
    fn stale_runs_leave_the_new_peer_alone() {
        let connector = ScriptBridgeConnector::new(ScriptDialectKind::Default);
        let inner = &connector.inner;
        let stale = inner.status.enable().unwrap();
        inner.status.disable();
        let current = inner.status.enable().unwrap();
        let (outgoing, _outgoing_rx) = mpsc::channel(1);
        let peer_token = current.child_token();
        *lock(&inner.peer) = Some(Peer {
            outgoing,
            token: peer_token.clone(),
            zero_based: false,
        });
        inner.status.mark_connected(ConnectorCapabilities::memory_only());

        inner.end_session(&stale);
        assert!(inner.peer_handle().is_some());
        assert!(!peer_token.is_cancelled());
        assert_eq!(inner.status.state(), ConnectionState::Connected);

        inner.end_session(&current);
        assert!(inner.peer_handle().is_none());
        assert!(peer_token.is_cancelled());
        assert_eq!(inner.status.state(), ConnectionState::Discovering);
    }

    #[tokio::test]
    async fn malformed_listen_address_ends_the_enable() {
        let connector = ScriptBridgeConnector::new(ScriptDialectKind::Default);
        connector
            .enable(&ConnectorSettings {
                script_address: "not an address".to_owned(),
                ..Default::default()
            })
            .await;
        for _ in 0..100 {
            if connector.state() == ConnectionState::Disconnected {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(connector.state(), ConnectionState::Disconnected);
        assert_eq!(connector.local_addr(), None);
    }

    #[tokio::test]
    async fn filesystem_verbs_are_unsupported() {
        let connector = ScriptBridgeConnector::new(ScriptDialectKind::Pipe);
        let mut events = connector.subscribe();
        connector.boot_rom(BootRomRequest::new("/game.sfc")).await;
        match events.recv().await.unwrap() {
            ConnectorEvent::RomBooted { outcome, .. } => {
                assert_eq!(outcome, Err(FileTransferError::Unsupported))
            }
            event => panic!("unexpected {:?}", event),
        }
    }
}
