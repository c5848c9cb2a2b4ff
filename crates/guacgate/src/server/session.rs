//! Per-connection session: authenticate, handshake, relay, teardown.
//!
//! One session owns one WebSocket and one guacd TCP connection, each with
//! exactly one reader and one writer (the two relay pumps). The pumps are
//! independently scheduled futures joined with `select!`, so a stalled
//! write in one direction never blocks the other, and either side
//! finishing cancels its peer. Backpressure is left to the kernel socket
//! buffers; the relay adds no queues.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::auth::{ConnectionHook, TokenCipher, UpgradeRequest};
use crate::config::Config;
use crate::error::GatewayError;
use crate::filter::{apply_filters, FilterDecision, InstructionFilter};
use crate::guacd::{GuacdClient, GuacdReader, GuacdWriter};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// Everything a session needs from the server. Immutable and shared.
pub struct SessionContext {
    pub config: Arc<Config>,
    pub cipher: Arc<TokenCipher>,
    pub hook: Arc<dyn ConnectionHook>,
    pub filters: Arc<Vec<Box<dyn InstructionFilter>>>,
}

/// Accept the WebSocket upgrade on `stream` and run the session to
/// completion. Never returns an error: every failure is reported to the
/// browser as a close code and logged here.
pub async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: Arc<SessionContext>) {
    let session_id = Uuid::new_v4().to_string();
    let mount_path = ctx.config.server.mount_path.clone();

    let mut upgrade: Option<UpgradeRequest> = None;
    let callback = |req: &Request, response: Response| {
        if req.uri().path() != mount_path {
            let mut not_found = ErrorResponse::new(None);
            *not_found.status_mut() = http::StatusCode::NOT_FOUND;
            return Err(not_found);
        }
        upgrade = Some(UpgradeRequest {
            path: req.uri().path().to_string(),
            query: req.uri().query().map(str::to_string),
            headers: req.headers().clone(),
        });
        Ok(response)
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(session_id = %session_id, peer = %peer, "WebSocket upgrade failed: {}", e);
            return;
        }
    };
    let request = match upgrade {
        Some(request) => request,
        None => return,
    };

    debug!(session_id = %session_id, peer = %peer, "WebSocket connection accepted");
    run_session(ws, request, &ctx, &session_id).await;
    debug!(session_id = %session_id, "Session released");
}

async fn run_session(
    mut ws: WebSocketStream<TcpStream>,
    request: UpgradeRequest,
    ctx: &SessionContext,
    session_id: &str,
) {
    // 1. Authenticate: the token query parameter is the sole credential.
    let token = request.query.as_deref().and_then(extract_token);
    let token = match token {
        Some(token) => token,
        None => {
            close_ws(&mut ws, &GatewayError::MissingToken, session_id).await;
            return;
        }
    };
    let settings = match ctx.cipher.decrypt(&token) {
        Ok(settings) => settings,
        Err(e) => {
            close_ws(&mut ws, &GatewayError::Token(e), session_id).await;
            return;
        }
    };

    // 2. Connection-settings hook.
    let protocol = settings.protocol;
    let settings = match ctx.hook.process_connection_settings(settings, &request) {
        Ok(settings) => settings,
        Err(e) => {
            close_ws(&mut ws, &e, session_id).await;
            return;
        }
    };
    if settings.protocol != protocol {
        let err = GatewayError::Internal("hook changed the connection type".into());
        close_ws(&mut ws, &err, session_id).await;
        return;
    }

    // 3. Dial guacd and complete the handshake within the budget.
    let budget = Duration::from_millis(ctx.config.guacd.connect_timeout_ms);
    let client = match timeout(
        budget,
        GuacdClient::connect(&ctx.config.guacd, &settings, session_id),
    )
    .await
    {
        Err(_) => {
            warn!(session_id = %session_id, "guacd handshake exceeded {:?}", budget);
            close_ws(&mut ws, &GatewayError::HandshakeTimeout, session_id).await;
            return;
        }
        Ok(Err(e)) => {
            close_ws(&mut ws, &e, session_id).await;
            return;
        }
        Ok(Ok(client)) => client,
    };
    info!(
        session_id = %session_id,
        connection_id = client.connection_id().unwrap_or(""),
        protocol = %protocol,
        "Session established"
    );

    // 4. Relay. The browser-side Guacamole client needs the ready
    // instruction; forward it as the first downstream frame.
    let ready_frame = client.ready_frame();
    let (mut guacd_reader, mut guacd_writer) = client.split();
    let (mut ws_sink, mut ws_stream) = ws.split();

    if let Some(frame) = ready_frame {
        let text = String::from_utf8_lossy(&frame).into_owned();
        if let Err(e) = ws_sink.send(Message::Text(text)).await {
            let reason = ws_send_error(e);
            finish(ws_sink, guacd_writer, reason, session_id).await;
            return;
        }
    }

    let max_inactivity = Duration::from_millis(ctx.config.client.max_inactivity_ms);
    let reason = {
        let down = downstream_pump(&mut guacd_reader, &mut ws_sink, &ctx.filters, session_id);
        let up = upstream_pump(&mut ws_stream, &mut guacd_writer, max_inactivity, session_id);
        tokio::pin!(down, up);
        // Either pump finishing tears the session down; dropping the other
        // future at the end of this block is the cancellation.
        tokio::select! {
            reason = &mut down => reason,
            reason = &mut up => reason,
        }
    };

    // 5. Teardown, idempotent: both sockets close regardless of which pump
    // ended and why.
    finish(ws_sink, guacd_writer, reason, session_id).await;
}

async fn finish(
    mut ws_sink: WsSink,
    mut guacd_writer: GuacdWriter,
    reason: GatewayError,
    session_id: &str,
) {
    info!(
        session_id = %session_id,
        code = reason.close_code(),
        "Session ended: {}", reason
    );
    let frame = CloseFrame {
        code: CloseCode::from(reason.close_code()),
        reason: reason.kind_name().into(),
    };
    let _ = ws_sink.send(Message::Close(Some(frame))).await;
    let _ = ws_sink.close().await;
    guacd_writer.shutdown().await;
}

/// guacd → browser. Each complete instruction becomes one text frame,
/// forwarded verbatim. Returns the reason the pump stopped.
async fn downstream_pump(
    reader: &mut GuacdReader,
    ws_sink: &mut WsSink,
    filters: &[Box<dyn InstructionFilter>],
    session_id: &str,
) -> GatewayError {
    loop {
        let (raw, instruction) = match reader.next().await {
            Ok(Some(pair)) => pair,
            Ok(None) => {
                debug!(session_id = %session_id, "guacd closed the connection");
                return GatewayError::PeerClosed;
            }
            Err(e) => return e,
        };

        if !filters.is_empty() {
            match apply_filters(filters, &instruction) {
                Ok(FilterDecision::Pass) => {}
                Ok(FilterDecision::Drop) => continue,
                Err(e) => return e,
            }
        }

        trace!(
            session_id = %session_id,
            "guacd->ws: {} ({} bytes)", instruction.opcode, raw.len()
        );
        let text = String::from_utf8_lossy(&raw).into_owned();
        if let Err(e) = ws_sink.send(Message::Text(text)).await {
            return ws_send_error(e);
        }
        // An explicit guacd disconnect is forwarded, then the session
        // closes in an orderly way; the TCP socket may well still be open.
        if instruction.opcode == "disconnect" {
            debug!(session_id = %session_id, "guacd sent disconnect");
            return GatewayError::PeerClosed;
        }
    }
}

/// browser → guacd. Text frames are forwarded verbatim, without
/// re-encoding; a frame may carry several concatenated instructions.
async fn upstream_pump(
    ws_stream: &mut WsStream,
    writer: &mut GuacdWriter,
    max_inactivity: Duration,
    session_id: &str,
) -> GatewayError {
    loop {
        let message = match timeout(max_inactivity, ws_stream.next()).await {
            Err(_) => {
                debug!(
                    session_id = %session_id,
                    "No client frame for {:?}", max_inactivity
                );
                return GatewayError::InactivityTimeout;
            }
            Ok(None) => return GatewayError::PeerClosed,
            Ok(Some(Err(e))) => return ws_recv_error(e),
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => {
                trace!(session_id = %session_id, "ws->guacd: {} bytes", text.len());
                if let Err(e) = writer.write_raw(text.as_bytes()).await {
                    return e;
                }
                // An explicit client disconnect is forwarded, then the
                // session closes in an orderly way.
                if text.ends_with("10.disconnect;") {
                    debug!(session_id = %session_id, "Client sent disconnect");
                    return GatewayError::PeerClosed;
                }
            }
            Message::Binary(_) => {
                warn!(session_id = %session_id, "Rejecting binary frame");
                return GatewayError::BadFrame;
            }
            Message::Close(_) => return GatewayError::PeerClosed,
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }
}

async fn close_ws(ws: &mut WebSocketStream<TcpStream>, err: &GatewayError, session_id: &str) {
    info!(
        session_id = %session_id,
        code = err.close_code(),
        "Closing session before relay: {}", err
    );
    let frame = CloseFrame {
        code: CloseCode::from(err.close_code()),
        reason: err.kind_name().into(),
    };
    let _ = ws.close(Some(frame)).await;
}

fn ws_send_error(e: WsError) -> GatewayError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed | WsError::Io(_) => {
            GatewayError::PeerClosed
        }
        other => GatewayError::Internal(other.to_string()),
    }
}

fn ws_recv_error(e: WsError) -> GatewayError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed | WsError::Io(_) => {
            GatewayError::PeerClosed
        }
        WsError::Protocol(_) | WsError::Utf8 => GatewayError::BadFrame,
        other => GatewayError::Internal(other.to_string()),
    }
}

/// Pull the `token` value out of a raw query string.
fn extract_token(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == "token" && !value.is_empty() {
            Some(percent_decode(value))
        } else {
            None
        }
    })
}

/// Minimal percent-decoding for query values. Tokens are URL-safe base64,
/// so in practice only `%3D` padding shows up, but any escape is handled.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => match u8::from_str_radix(&input[i + 1..i + 3], 16) {
                Ok(byte) => {
                    out.push(byte);
                    i += 3;
                }
                Err(_) => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
