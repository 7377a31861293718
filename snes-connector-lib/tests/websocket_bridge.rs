use std::{env, process, time::Duration};

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use snes_connector_lib::{
    AddressFormat, Capability, ConnectorService, ConnectorSettings, ConnectorType,
    FileListRequest, MemoryDomain, MemoryRequest, ServiceEvent, UploadFileRequest,
};
use tokio::{
    fs, join,
    net::{TcpListener, TcpStream},
    sync::broadcast,
    time::timeout,
};
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};

const WAIT: Duration = Duration::from_secs(10);

/// Scripted usb2snes style bridge with one emulator attached.
struct FakeBridge {
    socket: WebSocketStream<TcpStream>,
}

impl FakeBridge {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().await.unwrap();
        Self {
            socket: accept_async(stream).await.unwrap(),
        }
    }

    async fn next_message(&mut self) -> Message {
        timeout(WAIT, self.socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    async fn expect_envelope(&mut self, opcode: &str) -> Value {
        let message = self.next_message().await;
        let envelope: Value = serde_json::from_str(message.to_text().unwrap()).unwrap();
        assert_eq!(envelope["Opcode"], opcode, "{}", envelope);
        envelope
    }

    async fn expect(&mut self, opcode: &str) -> Vec<String> {
        self.expect_envelope(opcode).await["Operands"]
            .as_array()
            .unwrap()
            .iter()
            .map(|operand| operand.as_str().unwrap().to_owned())
            .collect()
    }

    async fn expect_binary(&mut self) -> Vec<u8> {
        let message = self.next_message().await;
        assert!(message.is_binary(), "{:?}", message);
        message.into_data().to_vec()
    }

    async fn reply(&mut self, results: &[&str]) {
        let text = json!({ "Results": results }).to_string();
        self.socket.send(Message::text(text)).await.unwrap();
    }

    async fn send_bytes(&mut self, bytes: &[u8]) {
        self.socket
            .send(Message::binary(bytes.to_vec()))
            .await
            .unwrap();
    }

    async fn handshake(&mut self) {
        self.expect("DeviceList").await;
        self.reply(&["EMU SNES9X"]).await;
        self.attach("EMU SNES9X", &["1.0", "SNES9X", "/roms/game.sfc", "NO_CONTROL_CMD"])
            .await;
    }

    /// Remaining handshake once `device` was listed.
    async fn attach(&mut self, device: &str, info: &[&str]) {
        assert_eq!(self.expect("Attach").await, [device]);
        assert_eq!(self.expect("Name").await, ["SnesConnectorLibrary"]);
        self.expect("Info").await;
        self.reply(info).await;
        assert_eq!(self.expect("GetAddress").await, ["F50020", "1"]);
        self.send_bytes(&[0]).await;
    }
}

async fn start() -> (TcpListener, ConnectorService, broadcast::Receiver<ServiceEvent>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let settings = ConnectorSettings {
        connector_type: ConnectorType::WebSocketBridge,
        websocket_address: listener.local_addr().unwrap().to_string(),
        ..Default::default()
    };
    let service = ConnectorService::with_default_connectors();
    let events = service.subscribe();
    service.connect(&settings).await;
    (listener, service, events)
}

async fn expect_attached(events: &mut broadcast::Receiver<ServiceEvent>) {
    let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(event, ServiceEvent::Connected(ConnectorType::WebSocketBridge));
    let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(event, ServiceEvent::GameDetected(ConnectorType::WebSocketBridge));
}

#[tokio::test]
async fn bridge_serves_reads_and_listings() {
    let (listener, service, mut events) = start().await;
    let mut bridge = FakeBridge::accept(&listener).await;
    bridge.handshake().await;
    expect_attached(&mut events).await;

    let capabilities = service.capabilities();
    assert!(capabilities.supports(Capability::AccessFiles));
    assert!(!capabilities.supports(Capability::PerformCommands));

    let request = MemoryRequest::retrieve(
        0x7E0100,
        3,
        MemoryDomain::ConsoleRam,
        AddressFormat::LinearOffset,
    );
    let (response, ()) = join!(service.make_memory_request_async(request), async {
        assert_eq!(bridge.expect("GetAddress").await, ["F50100", "3"]);
        bridge.send_bytes(&[1, 2]).await;
        bridge.send_bytes(&[3]).await;
    });
    assert!(response.successful);
    assert_eq!(response.data.unwrap().raw(), &[1, 2, 3]);

    let (listing, ()) = join!(service.get_file_list_async(FileListRequest::new("/roms")), async {
        assert_eq!(bridge.expect("List").await, ["/roms"]);
        bridge.reply(&["1", "game.sfc", "0", "hacks", "1", ".hidden"]).await;
    });
    assert!(listing.successful);
    let paths: Vec<_> = listing
        .files
        .iter()
        .map(|entry| entry.full_path().as_str())
        .collect();
    assert_eq!(paths, ["/roms/game.sfc", "/roms/hacks"]);

    service.disconnect().await;
    let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(event, ServiceEvent::Disconnected(ConnectorType::WebSocketBridge));
}

#[tokio::test]
async fn empty_device_list_is_asked_again() {
    let (listener, service, mut events) = start().await;
    let mut bridge = FakeBridge::accept(&listener).await;

    bridge.expect("DeviceList").await;
    bridge.reply(&[]).await;
    bridge.expect("DeviceList").await;
    bridge.reply(&["EMU SNES9X"]).await;
    bridge
        .attach("EMU SNES9X", &["1.0", "SNES9X", "/roms/game.sfc"])
        .await;
    expect_attached(&mut events).await;
    service.disconnect().await;
}

#[tokio::test]
async fn hardware_writes_go_through_the_command_space() {
    let (listener, service, mut events) = start().await;
    let mut bridge = FakeBridge::accept(&listener).await;
    bridge.expect("DeviceList").await;
    bridge.reply(&["SD2SNES COM3"]).await;
    bridge
        .attach("SD2SNES COM3", &["1.9.0", "SD2SNES", "/roms/game.sfc"])
        .await;
    expect_attached(&mut events).await;

    let request = MemoryRequest::update(
        0x7E0010,
        vec![0x12],
        MemoryDomain::ConsoleRam,
        AddressFormat::LinearOffset,
    );
    let (response, ()) = join!(service.make_memory_request_async(request), async {
        let envelope = bridge.expect_envelope("PutAddress").await;
        assert_eq!(envelope["Space"], "CMD");
        assert_eq!(envelope["Operands"], json!(["2C00", "1B"]));
        let program = bridge.expect_binary().await;
        assert_eq!(program.len(), 0x1B);
        assert_eq!(&program[7..13], &[0xA9, 0x12, 0x8F, 0x10, 0x00, 0x7E]);
    });
    assert!(response.successful);

    // Save RAM is written in place.
    let request = MemoryRequest::update(
        0xA06000,
        vec![1, 2],
        MemoryDomain::CartridgeSave,
        AddressFormat::LinearOffset,
    );
    let (response, ()) = join!(service.make_memory_request_async(request), async {
        let envelope = bridge.expect_envelope("PutAddress").await;
        assert_eq!(envelope["Space"], "SNES");
        assert_eq!(envelope["Operands"][1], "2");
        assert_eq!(bridge.expect_binary().await, [1, 2]);
    });
    assert!(response.successful);
    service.disconnect().await;
}

#[tokio::test]
async fn uploads_stream_the_file_in_chunks() {
    let local_path =
        env::temp_dir().join(format!("snes-connector-upload-{}.sfc", process::id()));
    let contents: Vec<u8> = (0..5000u32).map(|x| x as u8).collect();
    fs::write(&local_path, &contents).await.unwrap();

    let (listener, service, mut events) = start().await;
    let mut bridge = FakeBridge::accept(&listener).await;
    bridge.handshake().await;
    expect_attached(&mut events).await;

    let request = UploadFileRequest::new(local_path.to_string_lossy(), "/roms/patch.sfc");
    let (response, ()) = join!(service.upload_file_async(request), async {
        assert_eq!(bridge.expect("PutFile").await, ["/roms/patch.sfc", "1388"]);
        let mut received = bridge.expect_binary().await;
        assert_eq!(received.len(), 4096);
        received.extend(bridge.expect_binary().await);
        assert_eq!(received, contents);
        // Nothing acknowledges PutFile; the client lists the root once the
        // device had time to flush it.
        assert_eq!(bridge.expect("List").await, ["/"]);
        bridge.reply(&["1", "patch.sfc"]).await;
    });
    assert!(response.successful, "{:?}", response);

    service.disconnect().await;
    fs::remove_file(&local_path).await.unwrap();
}
