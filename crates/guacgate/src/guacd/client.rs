// Client-side guacd protocol handshake.
//
// Protocol flow:
//   1. Gateway -> guacd: select,<protocol>;  (or select,<connection-id>; for join)
//   2. guacd -> Gateway: args,<protocol>,<name1>,<name2>,...;
//   3. Gateway -> guacd: size,<width>,<height>,<dpi>;
//      then audio/video/image mimetype lists and timezone, each omitted
//      when empty
//   4. Gateway -> guacd: connect,<val1>,<val2>,...;  (positional, mirroring
//      the args name list)
//   5. guacd -> Gateway: ready,<connection-id>;
//
// The connect values are strictly positional: value i is the setting named
// by args element i+1, or the empty string when the token does not carry
// it. Settings guacd did not ask for are never forwarded.

use bytes::Bytes;
use guacgate_protocol::{Instruction, InstructionReader};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::auth::ConnectionSettings;
use crate::config::GuacdOptions;
use crate::error::{GatewayError, Result};

// Handshake geometry and mimetype defaults when the token carries none.
const DEFAULT_WIDTH: &str = "1024";
const DEFAULT_HEIGHT: &str = "768";
const DEFAULT_DPI: &str = "96";
const DEFAULT_AUDIO: &[&str] = &["audio/L16"];
const DEFAULT_IMAGE: &[&str] = &["image/png", "image/jpeg"];

/// Handshake lifecycle of the guacd link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Connecting,
    AwaitingArgs,
    Negotiating,
    AwaitingReady,
    Ready,
    Closed,
    Failed,
}

/// TCP connection to guacd, from dial through handshake completion.
///
/// After a successful handshake, [`split`](Self::split) hands exclusive
/// read and write halves to the two relay pumps.
#[derive(Debug)]
pub struct GuacdClient {
    stream: TcpStream,
    codec: InstructionReader,
    state: HandshakeState,
    connection_id: Option<String>,
    ready_frame: Option<Bytes>,
    session_id: String,
}

impl GuacdClient {
    /// Dial guacd and drive the handshake to `Ready`.
    ///
    /// The caller is responsible for bounding this with the configured
    /// handshake budget.
    pub async fn connect(
        options: &GuacdOptions,
        settings: &ConnectionSettings,
        session_id: &str,
    ) -> Result<Self> {
        let addr = format!("{}:{}", options.host, options.port);
        debug!(session_id = %session_id, addr = %addr, "Connecting to guacd");

        let stream = TcpStream::connect(&addr).await.map_err(|e| {
            warn!(session_id = %session_id, addr = %addr, "guacd connect failed: {}", e);
            GatewayError::UpstreamUnavailable(e.to_string())
        })?;

        let mut client = Self {
            stream,
            codec: InstructionReader::new(),
            state: HandshakeState::Connecting,
            connection_id: None,
            ready_frame: None,
            session_id: session_id.to_string(),
        };

        match client.handshake(settings).await {
            Ok(()) => Ok(client),
            Err(e) => {
                client.state = HandshakeState::Failed;
                Err(e)
            }
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Connection id assigned by guacd in `ready`.
    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    /// The raw `ready` instruction, for verbatim forwarding to the browser.
    pub fn ready_frame(&self) -> Option<Bytes> {
        self.ready_frame.clone()
    }

    /// Hand the connection to the relay: one reader, one writer, each with
    /// a single owner. Bytes guacd sent after `ready` stay buffered in the
    /// reader.
    pub fn split(self) -> (GuacdReader, GuacdWriter) {
        let (read_half, write_half) = self.stream.into_split();
        (
            GuacdReader {
                half: read_half,
                codec: self.codec,
            },
            GuacdWriter { half: write_half },
        )
    }

    async fn handshake(&mut self, settings: &ConnectionSettings) -> Result<()> {
        let select_target = settings
            .join
            .clone()
            .unwrap_or_else(|| settings.protocol.as_str().to_string());
        debug!(
            session_id = %self.session_id,
            "Handshake: sending select for '{}'", select_target
        );
        self.send(&Instruction::select(&select_target)).await?;
        self.state = HandshakeState::AwaitingArgs;

        let (args, _) = self.read_instruction().await?;
        if args.opcode != "args" {
            return Err(self.unexpected("args", &args));
        }
        // First element names the protocol; the rest are parameter names,
        // in the order connect values must mirror.
        let names: Vec<&str> = args.args.iter().skip(1).map(String::as_str).collect();
        debug!(
            session_id = %self.session_id,
            "Handshake: guacd asks for {} parameters", names.len()
        );
        self.state = HandshakeState::Negotiating;

        self.send_negotiation(settings).await?;

        self.send(&Instruction::connect(connect_values(&names, settings)))
            .await?;
        self.state = HandshakeState::AwaitingReady;

        let (ready, raw) = self.read_instruction().await?;
        if ready.opcode != "ready" {
            return Err(self.unexpected("ready", &ready));
        }
        let connection_id = ready.args.first().cloned().unwrap_or_default();
        debug!(
            session_id = %self.session_id,
            connection_id = %connection_id,
            "Handshake complete"
        );
        self.connection_id = Some(connection_id);
        self.ready_frame = Some(raw);
        self.state = HandshakeState::Ready;
        Ok(())
    }

    /// size/audio/video/image/timezone between `args` and `connect`.
    async fn send_negotiation(&mut self, settings: &ConnectionSettings) -> Result<()> {
        let width = preference(settings, "GUAC_WIDTH", "width", DEFAULT_WIDTH);
        let height = preference(settings, "GUAC_HEIGHT", "height", DEFAULT_HEIGHT);
        let dpi = preference(settings, "GUAC_DPI", "dpi", DEFAULT_DPI);
        self.send(&Instruction::new("size", vec![width, height, dpi]))
            .await?;

        let audio = mimetypes(settings, "GUAC_AUDIO", DEFAULT_AUDIO);
        if !audio.is_empty() {
            self.send(&Instruction::new("audio", audio)).await?;
        }
        let video = mimetypes(settings, "GUAC_VIDEO", &[]);
        if !video.is_empty() {
            self.send(&Instruction::new("video", video)).await?;
        }
        let image = mimetypes(settings, "GUAC_IMAGE", DEFAULT_IMAGE);
        if !image.is_empty() {
            self.send(&Instruction::new("image", image)).await?;
        }

        let timezone = settings
            .guac_override("GUAC_TIMEZONE")
            .or_else(|| settings.setting("timezone"))
            .unwrap_or("");
        if !timezone.is_empty() {
            self.send(&Instruction::new("timezone", vec![timezone.to_string()]))
                .await?;
        }
        Ok(())
    }

    fn unexpected(&self, expected: &str, received: &Instruction) -> GatewayError {
        if received.opcode == "error" {
            let message = received
                .args
                .first()
                .cloned()
                .unwrap_or_else(|| "Unknown guacd error".to_string());
            let code = received
                .args
                .get(1)
                .and_then(|c| c.parse::<u32>().ok())
                .unwrap_or(0);
            warn!(
                session_id = %self.session_id,
                "guacd sent error during handshake (expected '{}'): {} (code {})",
                expected, message, code
            );
            GatewayError::UpstreamRejected { code, message }
        } else {
            warn!(
                session_id = %self.session_id,
                "Unexpected guacd opcode '{}' while waiting for '{}'",
                received.opcode, expected
            );
            GatewayError::Protocol(format!(
                "expected guacd opcode '{}', got '{}'",
                expected, received.opcode
            ))
        }
    }

    async fn send(&mut self, instruction: &Instruction) -> Result<()> {
        self.stream
            .write_all(&instruction.encode())
            .await
            .map_err(|e| GatewayError::UpstreamIo(e.to_string()))?;
        self.stream
            .flush()
            .await
            .map_err(|e| GatewayError::UpstreamIo(e.to_string()))?;
        Ok(())
    }

    async fn read_instruction(&mut self) -> Result<(Instruction, Bytes)> {
        loop {
            if let Some(raw) = self.codec.next_frame()? {
                let instruction = Instruction::decode(&raw)?;
                return Ok((instruction, raw));
            }
            let mut buf = [0u8; 4096];
            let n = self
                .stream
                .read(&mut buf)
                .await
                .map_err(|e| GatewayError::UpstreamIo(e.to_string()))?;
            if n == 0 {
                return Err(GatewayError::UpstreamIo(
                    "guacd closed the connection during the handshake".into(),
                ));
            }
            self.codec.push(&buf[..n]);
        }
    }
}

/// Positional `connect` values for a guacd parameter name list: value i is
/// the setting named by element i, or the empty string when absent.
/// Settings guacd did not ask for are discarded.
pub fn connect_values(names: &[&str], settings: &ConnectionSettings) -> Vec<String> {
    names
        .iter()
        .map(|name| settings.setting(name).unwrap_or("").to_string())
        .collect()
}

/// String-valued handshake preference: GUAC_* override, then plain setting,
/// then default.
fn preference(settings: &ConnectionSettings, guac_key: &str, setting: &str, fallback: &str) -> String {
    settings
        .guac_override(guac_key)
        .or_else(|| settings.setting(setting))
        .unwrap_or(fallback)
        .to_string()
}

fn mimetypes(settings: &ConnectionSettings, guac_key: &str, fallback: &[&str]) -> Vec<String> {
    settings
        .guac_override_list(guac_key)
        .unwrap_or_else(|| fallback.iter().map(|s| s.to_string()).collect())
}

/// Read half of the guacd link. Single consumer by contract.
pub struct GuacdReader {
    half: OwnedReadHalf,
    codec: InstructionReader,
}

impl GuacdReader {
    /// Next instruction from guacd: raw wire bytes plus parsed form.
    /// `None` on clean EOF at an instruction boundary.
    pub async fn next(&mut self) -> Result<Option<(Bytes, Instruction)>> {
        loop {
            if let Some(raw) = self.codec.next_frame()? {
                let instruction = Instruction::decode(&raw)?;
                return Ok(Some((raw, instruction)));
            }
            let mut buf = [0u8; 8192];
            let n = self
                .half
                .read(&mut buf)
                .await
                .map_err(|e| GatewayError::UpstreamIo(e.to_string()))?;
            if n == 0 {
                if self.codec.is_empty() {
                    return Ok(None);
                }
                return Err(GatewayError::Protocol(
                    "guacd closed mid-instruction".into(),
                ));
            }
            self.codec.push(&buf[..n]);
        }
    }
}

/// Write half of the guacd link. Single producer by contract.
pub struct GuacdWriter {
    half: OwnedWriteHalf,
}

impl GuacdWriter {
    /// Write pre-encoded instruction bytes verbatim.
    pub async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.half
            .write_all(data)
            .await
            .map_err(|e| GatewayError::UpstreamIo(e.to_string()))?;
        self.half
            .flush()
            .await
            .map_err(|e| GatewayError::UpstreamIo(e.to_string()))?;
        Ok(())
    }

    pub async fn write_instruction(&mut self, instruction: &Instruction) -> Result<()> {
        self.write_raw(&instruction.encode()).await
    }

    pub async fn shutdown(&mut self) {
        let _ = self.half.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ProtocolKind;
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    fn rdp_settings() -> ConnectionSettings {
        let mut map = HashMap::new();
        map.insert("hostname".to_string(), "h".to_string());
        map.insert("port".to_string(), "3389".to_string());
        map.insert("ignored".to_string(), "never-sent".to_string());
        ConnectionSettings::new(ProtocolKind::Rdp, map)
    }

    struct MockPeer {
        stream: TcpStream,
        codec: InstructionReader,
    }

    impl MockPeer {
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

        /// Read instructions until `connect` arrives, returning everything
        /// seen in order.
        async fn read_until_connect(&mut self) -> Vec<Instruction> {
            let mut seen = Vec::new();
            loop {
                let instr = self.read_one().await;
                let done = instr.opcode == "connect";
                seen.push(instr);
                if done {
                    return seen;
                }
            }
        }

        async fn send(&mut self, instruction: &Instruction) {
            self.stream
                .write_all(&instruction.encode())
                .await
                .unwrap();
            self.stream.flush().await.unwrap();
        }
    }

    async fn mock_guacd() -> (TcpListener, GuacdOptions) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let options = GuacdOptions {
            host: "127.0.0.1".to_string(),
            port,
            connect_timeout_ms: 1_000,
        };
        (listener, options)
    }

    async fn accept(listener: &TcpListener) -> MockPeer {
        let (stream, _) = listener.accept().await.unwrap();
        MockPeer {
            stream,
            codec: InstructionReader::new(),
        }
    }

    fn args_reply() -> Instruction {
        Instruction::args(&["rdp", "hostname", "port", "username"])
    }

    #[tokio::test]
    async fn handshake_new_session() {
        let (listener, options) = mock_guacd().await;

        let server = tokio::spawn(async move {
            let mut peer = accept(&listener).await;
            let select = peer.read_one().await;
            assert_eq!(select, Instruction::select("rdp"));

            peer.send(&args_reply()).await;
            let seen = peer.read_until_connect().await;

            let opcodes: Vec<&str> = seen.iter().map(|i| i.opcode.as_str()).collect();
            assert_eq!(opcodes, vec!["size", "audio", "image", "connect"]);
            assert_eq!(seen[0].args, vec!["1024", "768", "96"]);
            assert_eq!(seen[1].args, vec!["audio/L16"]);
            assert_eq!(seen[2].args, vec!["image/png", "image/jpeg"]);

            // Positional values mirror the args name list exactly; missing
            // settings become empty strings, unrequested ones are dropped.
            assert_eq!(seen[3].args, vec!["h", "3389", ""]);

            peer.send(&Instruction::ready("$abc")).await;
            peer
        });

        let client = GuacdClient::connect(&options, &rdp_settings(), "test-session")
            .await
            .unwrap();
        let _peer = server.await.unwrap();

        assert_eq!(client.state(), HandshakeState::Ready);
        assert_eq!(client.connection_id(), Some("$abc"));
        assert_eq!(
            client.ready_frame().unwrap(),
            Instruction::ready("$abc").encode()
        );
    }

    #[tokio::test]
    async fn handshake_join_selects_connection_id() {
        let (listener, options) = mock_guacd().await;

        let server = tokio::spawn(async move {
            let mut peer = accept(&listener).await;
            let select = peer.read_one().await;
            assert_eq!(select, Instruction::select("$existing"));
            peer.send(&args_reply()).await;
            peer.read_until_connect().await;
            peer.send(&Instruction::ready("$existing")).await;
            peer
        });

        let settings = rdp_settings().with_join("$existing");
        let client = GuacdClient::connect(&options, &settings, "join-session")
            .await
            .unwrap();
        let _peer = server.await.unwrap();
        assert_eq!(client.connection_id(), Some("$existing"));
    }

    #[tokio::test]
    async fn handshake_honors_guac_overrides() {
        let (listener, options) = mock_guacd().await;

        let server = tokio::spawn(async move {
            let mut peer = accept(&listener).await;
            peer.read_one().await;
            peer.send(&args_reply()).await;
            let seen = peer.read_until_connect().await;
            let opcodes: Vec<&str> = seen.iter().map(|i| i.opcode.as_str()).collect();
            assert_eq!(
                opcodes,
                vec!["size", "audio", "video", "image", "timezone", "connect"]
            );
            assert_eq!(seen[0].args, vec!["1920", "1080", "96"]);
            assert_eq!(seen[2].args, vec!["video/webm"]);
            assert_eq!(seen[4].args, vec!["Europe/Berlin"]);
            peer.send(&Instruction::ready("$x")).await;
            peer
        });

        let settings = rdp_settings()
            .with_guac_override("GUAC_WIDTH", "1920")
            .with_guac_override("GUAC_HEIGHT", "1080")
            .with_guac_override_list("GUAC_VIDEO", &["video/webm"])
            .with_guac_override("GUAC_TIMEZONE", "Europe/Berlin");
        let client = GuacdClient::connect(&options, &settings, "override-session")
            .await
            .unwrap();
        let _peer = server.await.unwrap();
        assert_eq!(client.state(), HandshakeState::Ready);
    }

    #[tokio::test]
    async fn handshake_upstream_error_is_rejection() {
        let (listener, options) = mock_guacd().await;

        tokio::spawn(async move {
            let mut peer = accept(&listener).await;
            peer.read_one().await;
            peer.send(&Instruction::error("bad-proto", 256)).await;
            // hold the socket open; the client fails on the error itself
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        });

        let err = GuacdClient::connect(&options, &rdp_settings(), "err-session")
            .await
            .unwrap_err();
        match err {
            GatewayError::UpstreamRejected { code, message } => {
                assert_eq!(code, 256);
                assert_eq!(message, "bad-proto");
            }
            other => panic!("expected UpstreamRejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handshake_unexpected_opcode_is_protocol_error() {
        let (listener, options) = mock_guacd().await;

        tokio::spawn(async move {
            let mut peer = accept(&listener).await;
            peer.read_one().await;
            peer.send(&Instruction::new("sync", vec!["1".to_string()]))
                .await;
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        });

        let err = GuacdClient::connect(&options, &rdp_settings(), "proto-session")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Protocol(_)));
    }

    #[tokio::test]
    async fn connect_refused_is_unavailable() {
        // Bind then drop to get a port with (very likely) no listener.
        let (listener, options) = mock_guacd().await;
        drop(listener);

        let err = GuacdClient::connect(&options, &rdp_settings(), "down-session")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn relay_halves_preserve_buffered_bytes() {
        let (listener, options) = mock_guacd().await;

        let server = tokio::spawn(async move {
            let mut peer = accept(&listener).await;
            peer.read_one().await;
            peer.send(&args_reply()).await;
            peer.read_until_connect().await;
            // ready and a follow-up instruction in one write: the follow-up
            // must surface through the reader after split
            peer.stream
                .write_all(b"5.ready,4.$abc;4.sync,2.17;")
                .await
                .unwrap();
            peer.stream.flush().await.unwrap();
            peer
        });

        let client = GuacdClient::connect(&options, &rdp_settings(), "buffer-session")
            .await
            .unwrap();
        let _peer = server.await.unwrap();

        let (mut reader, _writer) = client.split();
        let (raw, instr) = reader.next().await.unwrap().unwrap();
        assert_eq!(&raw[..], b"4.sync,2.17;");
        assert_eq!(instr.opcode, "sync");
        assert_eq!(instr.args, vec!["17"]);
    }
}
