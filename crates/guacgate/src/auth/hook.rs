//! Connection-settings hook.
//!
//! The only supported authorization extension point: invoked once per
//! session, after token decryption and before guacd is dialed. A hook may
//! rewrite connection parameters (credential injection, host pinning) or
//! refuse the session outright, but must preserve the connection type.

use http::HeaderMap;

use crate::auth::ConnectionSettings;
use crate::error::{GatewayError, Result};

/// The parts of the WebSocket upgrade request a hook may inspect.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    /// Request path, e.g. `/`.
    pub path: String,
    /// Raw query string, without the leading `?`.
    pub query: Option<String>,
    /// Request headers.
    pub headers: HeaderMap,
}

/// Capability for vetting and rewriting decrypted connection settings.
pub trait ConnectionHook: Send + Sync {
    /// Return possibly-modified settings, or `GatewayError::ConnectionRefused`
    /// to reject the session (closed with code 4403).
    fn process_connection_settings(
        &self,
        settings: ConnectionSettings,
        request: &UpgradeRequest,
    ) -> Result<ConnectionSettings>;
}

/// Default hook: passes settings through untouched.
pub struct AcceptAll;

impl ConnectionHook for AcceptAll {
    fn process_connection_settings(
        &self,
        settings: ConnectionSettings,
        _request: &UpgradeRequest,
    ) -> Result<ConnectionSettings> {
        Ok(settings)
    }
}

/// Hook that refuses every connection; useful for drain mode and tests.
pub struct RefuseAll;

impl ConnectionHook for RefuseAll {
    fn process_connection_settings(
        &self,
        _settings: ConnectionSettings,
        _request: &UpgradeRequest,
    ) -> Result<ConnectionSettings> {
        Err(GatewayError::ConnectionRefused(
            "connections are not being accepted".into(),
        ))
    }
}
