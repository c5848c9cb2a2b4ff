//! Configuration types

mod loader;

pub use loader::{load_config, load_config_from_str};

use serde::Deserialize;

/// Cipher name accepted by the token layer. The token format is pinned to
/// AES-256-CBC; the field exists so a config with anything else is rejected
/// loudly instead of decrypting garbage.
pub const TOKEN_CYPHER: &str = "AES-256-CBC";

/// Root configuration structure.
///
/// ```yaml
/// server:
///   listen_address: "0.0.0.0"
///   listen_port: 8080
///
/// crypt:
///   cypher: AES-256-CBC
///   key: "MySuperSecretKeyForParamsToken12"
///
/// guacd:
///   host: "127.0.0.1"
///   port: 4822
///   connect_timeout_ms: 10000
///
/// client:
///   max_inactivity_ms: 10000
/// ```
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Token encryption configuration
    pub crypt: CryptConfig,

    /// guacd link configuration
    #[serde(default)]
    pub guacd: GuacdOptions,

    /// Per-client session configuration
    #[serde(default)]
    pub client: ClientOptions,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.crypt.cypher != TOKEN_CYPHER {
            return Err(format!(
                "Unsupported cypher '{}'. Only '{}' is supported",
                self.crypt.cypher, TOKEN_CYPHER
            ));
        }
        if self.crypt.key.len() != 32 {
            return Err(format!(
                "crypt.key must be exactly 32 bytes, got {}",
                self.crypt.key.len()
            ));
        }
        if !self.server.mount_path.starts_with('/') {
            return Err(format!(
                "server.mount_path must start with '/', got '{}'",
                self.server.mount_path
            ));
        }
        Ok(())
    }
}

/// WebSocket listener configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Port to bind
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Path upgrades are accepted on; anything else is refused with 404
    #[serde(default = "default_mount_path")]
    pub mount_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            listen_port: default_listen_port(),
            mount_path: default_mount_path(),
        }
    }
}

/// Token encryption configuration
#[derive(Debug, Deserialize)]
pub struct CryptConfig {
    /// Cipher name; must be AES-256-CBC
    #[serde(default = "default_cypher")]
    pub cypher: String,

    /// 32-byte encryption key shared with the token issuer
    pub key: String,
}

/// guacd link configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GuacdOptions {
    /// guacd host
    #[serde(default = "default_guacd_host")]
    pub host: String,

    /// guacd port
    #[serde(default = "default_guacd_port")]
    pub port: u16,

    /// Budget for TCP connect plus the protocol handshake, in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for GuacdOptions {
    fn default() -> Self {
        Self {
            host: default_guacd_host(),
            port: default_guacd_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Per-client session configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClientOptions {
    /// Close the session when no browser frame arrives for this long,
    /// in milliseconds
    #[serde(default = "default_max_inactivity_ms")]
    pub max_inactivity_ms: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            max_inactivity_ms: default_max_inactivity_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (overridden by RUST_LOG and --verbose)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_mount_path() -> String {
    "/".to_string()
}

fn default_cypher() -> String {
    TOKEN_CYPHER.to_string()
}

fn default_guacd_host() -> String {
    "127.0.0.1".to_string()
}

fn default_guacd_port() -> u16 {
    4822
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_max_inactivity_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}
