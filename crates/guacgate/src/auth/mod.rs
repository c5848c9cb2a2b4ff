//! Token authentication and the connection-settings hook.
//!
//! The encrypted token is the sole authentication surface of the gateway:
//! whoever can mint a valid token controls every parameter forwarded to
//! guacd. Everything in [`token`] therefore fails closed, with one typed
//! error per validation stage.

mod hook;
mod token;

pub use hook::{AcceptAll, ConnectionHook, RefuseAll, UpgradeRequest};
pub use token::{
    ConnectionSettings, ProtocolKind, TokenCipher, TokenError, BLOCK_SIZE, KEY_SIZE,
};
