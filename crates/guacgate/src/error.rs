//! Error types for guacgate.

use guacgate_protocol::CodecError;
use thiserror::Error;

use crate::auth::TokenError;

/// Main error type for the gateway.
///
/// Every session-terminating condition maps to one of these kinds; the
/// WebSocket close code derived from the kind is the only stable error
/// signal the browser sees.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The upgrade request carried no `token` query parameter.
    #[error("missing connection token")]
    MissingToken,

    /// Token decryption or validation failure.
    #[error("invalid connection token: {0}")]
    Token(#[from] TokenError),

    /// The connection-settings hook refused the session.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// Could not reach guacd at all.
    #[error("guacd unavailable: {0}")]
    UpstreamUnavailable(String),

    /// guacd answered the handshake with an `error` instruction.
    #[error("guacd rejected the connection: {message} (code {code})")]
    UpstreamRejected { code: u32, message: String },

    /// I/O failure on the guacd link.
    #[error("guacd I/O error: {0}")]
    UpstreamIo(String),

    /// Guacamole wire-protocol violation on either link.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The guacd handshake did not complete within its budget.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// No browser frame arrived within the inactivity budget.
    #[error("inactivity timeout")]
    InactivityTimeout,

    /// The browser sent a frame type the relay does not accept.
    #[error("unsupported websocket frame")]
    BadFrame,

    /// Either peer closed the connection; normal teardown.
    #[error("peer closed the connection")]
    PeerClosed,

    /// Configuration rejected at load or construction time.
    #[error("configuration error: {0}")]
    Config(String),

    /// Anything that should not happen.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for GatewayError.
pub type Result<T> = std::result::Result<T, GatewayError>;

impl From<CodecError> for GatewayError {
    fn from(err: CodecError) -> Self {
        GatewayError::Protocol(err.to_string())
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        GatewayError::Config(err.to_string())
    }
}

impl GatewayError {
    /// WebSocket application close code for this error kind.
    pub fn close_code(&self) -> u16 {
        match self {
            GatewayError::MissingToken => 4001,
            GatewayError::BadFrame => 4400,
            GatewayError::Token(_) => 4401,
            GatewayError::ConnectionRefused(_) => 4403,
            GatewayError::InactivityTimeout => 4408,
            GatewayError::HandshakeTimeout => 4504,
            GatewayError::PeerClosed => 1000,
            GatewayError::UpstreamUnavailable(_)
            | GatewayError::UpstreamRejected { .. }
            | GatewayError::UpstreamIo(_)
            | GatewayError::Protocol(_)
            | GatewayError::Config(_)
            | GatewayError::Internal(_) => 1011,
        }
    }

    /// Stable kind name used as the close reason. Deliberately free of any
    /// underlying message so key material, settings, or I/O detail can never
    /// leak to the browser.
    pub fn kind_name(&self) -> &'static str {
        match self {
            GatewayError::MissingToken => "Unauthorized",
            GatewayError::Token(err) => err.kind_name(),
            GatewayError::ConnectionRefused(_) => "ConnectionRefused",
            GatewayError::UpstreamUnavailable(_) => "UpstreamUnavailable",
            GatewayError::UpstreamRejected { .. } => "UpstreamRejected",
            GatewayError::UpstreamIo(_) => "UpstreamIO",
            GatewayError::Protocol(_) => "ProtocolError",
            GatewayError::HandshakeTimeout => "HandshakeTimeout",
            GatewayError::InactivityTimeout => "InactivityTimeout",
            GatewayError::BadFrame => "BadFrame",
            GatewayError::PeerClosed => "",
            GatewayError::Config(_) => "Internal",
            GatewayError::Internal(_) => "Internal",
        }
    }
}
