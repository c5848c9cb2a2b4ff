//! End-to-end session tests: a real WebSocket client on one side, a
//! scripted mock guacd on the other, the gateway in between.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::{
    engine::general_purpose::STANDARD as BASE64,
    engine::general_purpose::URL_SAFE as URL_SAFE_BASE64, Engine as _,
};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use guacgate::protocol::{Instruction, InstructionReader};
use guacgate::{Config, ConnectionSettings, Gateway, ProtocolKind, TokenCipher};

const KEY: [u8; 32] = [b'A'; 32];

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── Test fixtures ────────────────────────────────────────────────────

fn test_config(guacd_port: u16, connect_timeout_ms: u64, max_inactivity_ms: u64) -> Config {
    let yaml = format!(
        r#"
server:
  listen_address: "127.0.0.1"
  listen_port: 0

crypt:
  key: "{}"

guacd:
  host: "127.0.0.1"
  port: {guacd_port}
  connect_timeout_ms: {connect_timeout_ms}

client:
  max_inactivity_ms: {max_inactivity_ms}
"#,
        std::str::from_utf8(&KEY).unwrap(),
    );
    guacgate::load_config_from_str(&yaml).unwrap()
}

async fn start_gateway(config: Config) -> (std::net::SocketAddr, broadcast::Sender<()>) {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let gateway = Gateway::bind(Arc::new(config), shutdown_rx).await.unwrap();
    let addr = gateway.local_addr().unwrap();
    tokio::spawn(gateway.run());
    (addr, shutdown_tx)
}

fn rdp_settings() -> ConnectionSettings {
    let mut map = HashMap::new();
    map.insert("hostname".to_string(), "h".to_string());
    map.insert("port".to_string(), "3389".to_string());
    ConnectionSettings::new(ProtocolKind::Rdp, map)
}

fn token() -> String {
    TokenCipher::from_key(KEY).encrypt(&rdp_settings()).unwrap()
}

// ── Mock guacd ───────────────────────────────────────────────────────

struct MockGuacd {
    stream: TcpStream,
    codec: InstructionReader,
}

impl MockGuacd {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().await.unwrap();
        Self {
            stream,
            codec: InstructionReader::new(),
        }
    }

    async fn read_one(&mut self) -> Instruction {
        loop {
            if let Some(instr) = self.codec.next_instruction().unwrap() {
                return instr;
            }
            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "gateway closed the guacd link unexpectedly");
            self.codec.push(&buf[..n]);
        }
    }

    async fn read_until(&mut self, opcode: &str) -> Instruction {
        loop {
            let instr = self.read_one().await;
            if instr.opcode == opcode {
                return instr;
            }
        }
    }

    async fn send(&mut self, instruction: &Instruction) {
        self.send_raw(&instruction.encode()).await;
    }

    async fn send_raw(&mut self, data: &[u8]) {
        self.stream.write_all(data).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// Drive select → args → connect → ready and return the connect values.
    async fn complete_handshake(&mut self, connection_id: &str) -> Instruction {
        let select = self.read_one().await;
        assert_eq!(select, Instruction::select("rdp"));
        self.send(&Instruction::args(&["rdp", "hostname", "port", "username"]))
            .await;
        let connect = self.read_until("connect").await;
        self.send(&Instruction::ready(connection_id)).await;
        connect
    }
}

async fn guacd_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

// ── WebSocket client helpers ─────────────────────────────────────────

async fn ws_connect(addr: std::net::SocketAddr, token: Option<&str>) -> WsClient {
    let url = match token {
        Some(token) => format!("ws://{addr}/?token={token}"),
        None => format!("ws://{addr}/"),
    };
    let (ws, _) = connect_async(url.as_str()).await.unwrap();
    ws
}

async fn expect_text(ws: &mut WsClient) -> String {
    loop {
        match timeout(Duration::from_secs(5), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return text,
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}

async fn expect_close(ws: &mut WsClient) -> (u16, String) {
    loop {
        match timeout(Duration::from_secs(5), ws.next()).await {
            Ok(Some(Ok(Message::Close(Some(frame))))) => {
                return (frame.code.into(), frame.reason.into_owned())
            }
            Ok(Some(Ok(Message::Close(None)))) => return (1005, String::new()),
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(e))) => panic!("websocket error before close: {e}"),
            Ok(None) => panic!("stream ended without a close frame"),
            Err(_) => panic!("timed out waiting for close frame"),
        }
    }
}

// ── Scenarios ────────────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_relays_both_directions() {
    let (listener, guacd_port) = guacd_listener().await;
    let (addr, _shutdown) = start_gateway(test_config(guacd_port, 2_000, 10_000)).await;

    let guacd = tokio::spawn(async move {
        let mut guacd = MockGuacd::accept(&listener).await;
        let connect = guacd.complete_handshake("$abc").await;
        // Positional values mirror the args name list; the missing
        // username becomes an empty string.
        assert_eq!(connect.args, vec!["h", "3389", ""]);

        // Browser frame arrives verbatim
        let key = guacd.read_one().await;
        assert_eq!(key.encode(), Instruction::new("key", vec!["100".into(), "1".into()]).encode());

        guacd.send_raw(b"4.sync,2.42;").await;
        guacd
    });

    let mut ws = ws_connect(addr, Some(&token())).await;

    // ready is forwarded verbatim as the first downstream frame
    assert_eq!(expect_text(&mut ws).await, "5.ready,4.$abc;");

    ws.send(Message::Text("3.key,3.100,1.1;".to_string()))
        .await
        .unwrap();

    assert_eq!(expect_text(&mut ws).await, "4.sync,2.42;");

    let _guacd = guacd.await.unwrap();

    // Orderly client-initiated close
    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn tampered_token_closes_4401() {
    let (_listener, guacd_port) = guacd_listener().await;
    let (addr, _shutdown) = start_gateway(test_config(guacd_port, 2_000, 10_000)).await;

    // Flip one bit in the middle of the ciphertext
    let envelope = URL_SAFE_BASE64.decode(token()).unwrap();
    let mut envelope: serde_json::Value = serde_json::from_slice(&envelope).unwrap();
    let mut ciphertext = BASE64
        .decode(envelope["value"].as_str().unwrap())
        .unwrap();
    let mid = ciphertext.len() / 2;
    ciphertext[mid] ^= 0x01;
    envelope["value"] = serde_json::Value::String(BASE64.encode(&ciphertext));
    let tampered = URL_SAFE_BASE64.encode(serde_json::to_vec(&envelope).unwrap());

    let mut ws = ws_connect(addr, Some(&tampered)).await;
    let (code, reason) = expect_close(&mut ws).await;
    assert_eq!(code, 4401);
    // Reason names the error kind, nothing more
    assert!(
        reason == "InvalidPadding" || reason == "MalformedPayload",
        "unexpected reason: {reason}"
    );
}

#[tokio::test]
async fn missing_token_closes_4001() {
    let (_listener, guacd_port) = guacd_listener().await;
    let (addr, _shutdown) = start_gateway(test_config(guacd_port, 2_000, 10_000)).await;

    let mut ws = ws_connect(addr, None).await;
    let (code, _) = expect_close(&mut ws).await;
    assert_eq!(code, 4001);
}

#[tokio::test]
async fn handshake_timeout_closes_4504() {
    let (listener, guacd_port) = guacd_listener().await;
    let (addr, _shutdown) = start_gateway(test_config(guacd_port, 200, 10_000)).await;

    // Accept TCP but never answer the handshake
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(stream);
    });

    let mut ws = ws_connect(addr, Some(&token())).await;
    let (code, reason) = expect_close(&mut ws).await;
    assert_eq!(code, 4504);
    assert_eq!(reason, "HandshakeTimeout");
}

#[tokio::test]
async fn upstream_rejection_closes_without_ready() {
    let (listener, guacd_port) = guacd_listener().await;
    let (addr, _shutdown) = start_gateway(test_config(guacd_port, 2_000, 10_000)).await;

    tokio::spawn(async move {
        let mut guacd = MockGuacd::accept(&listener).await;
        let select = guacd.read_one().await;
        assert_eq!(select.opcode, "select");
        guacd.send(&Instruction::error("bad-proto", 256)).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let mut ws = ws_connect(addr, Some(&token())).await;
    // The next (and only) frame must be the close; no ready ever arrives.
    let (code, reason) = expect_close(&mut ws).await;
    assert_eq!(code, 1011);
    assert_eq!(reason, "UpstreamRejected");
}

#[tokio::test]
async fn inactivity_closes_4408() {
    let (listener, guacd_port) = guacd_listener().await;
    let (addr, _shutdown) = start_gateway(test_config(guacd_port, 2_000, 200)).await;

    tokio::spawn(async move {
        let mut guacd = MockGuacd::accept(&listener).await;
        guacd.complete_handshake("$quiet").await;
        // Keep the link open; the browser stays silent
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let mut ws = ws_connect(addr, Some(&token())).await;
    assert_eq!(expect_text(&mut ws).await, "5.ready,6.$quiet;");

    let (code, reason) = expect_close(&mut ws).await;
    assert_eq!(code, 4408);
    assert_eq!(reason, "InactivityTimeout");
}

#[tokio::test]
async fn binary_frame_closes_4400() {
    let (listener, guacd_port) = guacd_listener().await;
    let (addr, _shutdown) = start_gateway(test_config(guacd_port, 2_000, 10_000)).await;

    tokio::spawn(async move {
        let mut guacd = MockGuacd::accept(&listener).await;
        guacd.complete_handshake("$bin").await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let mut ws = ws_connect(addr, Some(&token())).await;
    assert_eq!(expect_text(&mut ws).await, "5.ready,4.$bin;");

    ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    let (code, reason) = expect_close(&mut ws).await;
    assert_eq!(code, 4400);
    assert_eq!(reason, "BadFrame");
}

#[tokio::test]
async fn guacd_socket_close_ends_session_normally() {
    let (listener, guacd_port) = guacd_listener().await;
    let (addr, _shutdown) = start_gateway(test_config(guacd_port, 2_000, 10_000)).await;

    tokio::spawn(async move {
        let mut guacd = MockGuacd::accept(&listener).await;
        guacd.complete_handshake("$gone").await;
        guacd.send_raw(b"4.sync,2.99;").await;
        // Dropping the socket closes the guacd side
    });

    let mut ws = ws_connect(addr, Some(&token())).await;
    assert_eq!(expect_text(&mut ws).await, "5.ready,5.$gone;");

    // Traffic before the EOF still arrives, then the session closes 1000.
    assert_eq!(expect_text(&mut ws).await, "4.sync,2.99;");
    let (code, _) = expect_close(&mut ws).await;
    assert_eq!(code, 1000);
}

#[tokio::test]
async fn guacd_disconnect_instruction_ends_session_with_socket_open() {
    let (listener, guacd_port) = guacd_listener().await;
    let (addr, _shutdown) = start_gateway(test_config(guacd_port, 2_000, 10_000)).await;

    tokio::spawn(async move {
        let mut guacd = MockGuacd::accept(&listener).await;
        guacd.complete_handshake("$held").await;
        guacd.send_raw(b"10.disconnect;").await;
        // Hold the TCP socket open well past the assertion window: the
        // close below must come from the disconnect opcode, not from EOF.
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(guacd);
    });

    let mut ws = ws_connect(addr, Some(&token())).await;
    assert_eq!(expect_text(&mut ws).await, "5.ready,5.$held;");

    // The in-band disconnect is forwarded, then the session closes 1000
    // promptly even though guacd's socket is still up.
    assert_eq!(expect_text(&mut ws).await, "10.disconnect;");
    let (code, _) = timeout(Duration::from_secs(2), expect_close(&mut ws))
        .await
        .expect("close frame should not wait for the guacd socket");
    assert_eq!(code, 1000);
}

#[tokio::test]
async fn client_disconnect_instruction_ends_session_with_sockets_open() {
    let (listener, guacd_port) = guacd_listener().await;
    let (addr, _shutdown) = start_gateway(test_config(guacd_port, 2_000, 10_000)).await;

    let guacd = tokio::spawn(async move {
        let mut guacd = MockGuacd::accept(&listener).await;
        guacd.complete_handshake("$bye").await;
        // The browser's disconnect must reach guacd before the close
        let forwarded = guacd.read_one().await;
        assert_eq!(forwarded.opcode, "disconnect");
        tokio::time::sleep(Duration::from_secs(30)).await;
        guacd
    });

    let mut ws = ws_connect(addr, Some(&token())).await;
    assert_eq!(expect_text(&mut ws).await, "5.ready,4.$bye;");

    ws.send(Message::Text("10.disconnect;".to_string()))
        .await
        .unwrap();
    let (code, _) = timeout(Duration::from_secs(2), expect_close(&mut ws))
        .await
        .expect("close frame should not wait for either socket");
    assert_eq!(code, 1000);
    guacd.abort();
}
