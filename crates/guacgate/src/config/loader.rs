//! Configuration loader

use super::Config;
use crate::error::{GatewayError, Result};
use std::path::Path;

/// Load configuration from a YAML file.
///
/// Also applies GUACGATE_* env var overrides after loading.
pub fn load_config(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| GatewayError::Config(format!("cannot read {}: {}", path.display(), e)))?;
    load_config_from_str(&contents)
}

/// Load configuration from a YAML string (useful for testing).
///
/// Also applies GUACGATE_* env var overrides after loading.
pub fn load_config_from_str(yaml: &str) -> Result<Config> {
    let mut config: Config = serde_yaml::from_str(yaml)?;
    apply_env_overrides(&mut config);
    config.validate().map_err(GatewayError::Config)?;
    Ok(config)
}

/// Apply GUACGATE_* environment variable overrides to a config.
///
/// Any set env var overrides the corresponding config value:
/// - `GUACGATE_LISTEN_ADDRESS` - Override listen address
/// - `GUACGATE_LISTEN_PORT` - Override listen port
/// - `GUACGATE_SECRET_KEY` - Override the token encryption key
/// - `GUACGATE_GUACD_HOST` - Override guacd host
/// - `GUACGATE_GUACD_PORT` - Override guacd port
/// - `GUACGATE_CONNECT_TIMEOUT_MS` - Override handshake budget
/// - `GUACGATE_MAX_INACTIVITY_MS` - Override inactivity budget
/// - `GUACGATE_LOG_LEVEL` - Override log level
pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("GUACGATE_LISTEN_ADDRESS") {
        debug!("Overriding listen_address from GUACGATE_LISTEN_ADDRESS");
        config.server.listen_address = val;
    }
    if let Ok(val) = std::env::var("GUACGATE_LISTEN_PORT") {
        if let Ok(port) = val.parse::<u16>() {
            debug!("Overriding listen_port from GUACGATE_LISTEN_PORT");
            config.server.listen_port = port;
        }
    }
    if let Ok(val) = std::env::var("GUACGATE_SECRET_KEY") {
        debug!("Overriding crypt.key from GUACGATE_SECRET_KEY");
        config.crypt.key = val;
    }
    if let Ok(val) = std::env::var("GUACGATE_GUACD_HOST") {
        debug!("Overriding guacd.host from GUACGATE_GUACD_HOST");
        config.guacd.host = val;
    }
    if let Ok(val) = std::env::var("GUACGATE_GUACD_PORT") {
        if let Ok(port) = val.parse::<u16>() {
            debug!("Overriding guacd.port from GUACGATE_GUACD_PORT");
            config.guacd.port = port;
        }
    }
    if let Ok(val) = std::env::var("GUACGATE_CONNECT_TIMEOUT_MS") {
        if let Ok(ms) = val.parse::<u64>() {
            debug!("Overriding connect_timeout_ms from GUACGATE_CONNECT_TIMEOUT_MS");
            config.guacd.connect_timeout_ms = ms;
        }
    }
    if let Ok(val) = std::env::var("GUACGATE_MAX_INACTIVITY_MS") {
        if let Ok(ms) = val.parse::<u64>() {
            debug!("Overriding max_inactivity_ms from GUACGATE_MAX_INACTIVITY_MS");
            config.client.max_inactivity_ms = ms;
        }
    }
    if let Ok(val) = std::env::var("GUACGATE_LOG_LEVEL") {
        debug!("Overriding log level from GUACGATE_LOG_LEVEL");
        config.logging.level = val;
    }
}
