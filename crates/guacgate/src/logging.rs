//! Logging macros that set target to "guacgate" for all log calls.
//!
//! Without an explicit target, tracing uses the full module path
//! (e.g., "guacgate::server::session"), which makes per-component filtering
//! noisy for operators. These macros ensure all logs from this crate use a
//! single "guacgate" target.

macro_rules! trace {
    ($($arg:tt)*) => { ::tracing::trace!(target: "guacgate", $($arg)*) };
}

macro_rules! debug {
    ($($arg:tt)*) => { ::tracing::debug!(target: "guacgate", $($arg)*) };
}

macro_rules! info {
    ($($arg:tt)*) => { ::tracing::info!(target: "guacgate", $($arg)*) };
}

macro_rules! warn {
    ($($arg:tt)*) => { ::tracing::warn!(target: "guacgate", $($arg)*) };
}

macro_rules! error {
    ($($arg:tt)*) => { ::tracing::error!(target: "guacgate", $($arg)*) };
}
