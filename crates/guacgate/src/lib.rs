//! guacgate - WebSocket gateway for the Guacamole remote-framebuffer protocol
//!
//! Bridges browser-side Guacamole clients to a backend guacd daemon:
//! - Authenticates each connection via an encrypted token in the URL
//! - Dials guacd and performs the select/args/connect/ready handshake on
//!   the client's behalf
//! - Relays Guacamole instructions in both directions until either side
//!   disconnects

#[macro_use]
mod logging;

pub mod auth;
pub mod config;
pub mod error;
pub mod filter;
pub mod guacd;
pub mod server;

pub use guacgate_protocol as protocol;

pub use auth::{
    AcceptAll, ConnectionHook, ConnectionSettings, ProtocolKind, TokenCipher, TokenError,
    UpgradeRequest,
};
pub use config::{load_config, load_config_from_str, Config};
pub use error::{GatewayError, Result};
pub use filter::{ErrorFilter, FilterDecision, InstructionFilter, UpstreamStatus};
pub use guacd::{GuacdClient, GuacdReader, GuacdWriter, HandshakeState};
pub use server::Gateway;
