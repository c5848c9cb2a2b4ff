//! TCP listener for incoming WebSocket connections.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;

use super::session::{handle_connection, SessionContext};
use crate::auth::{AcceptAll, ConnectionHook, TokenCipher};
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::filter::InstructionFilter;

/// The gateway: accepts WebSocket upgrades on a single path and runs one
/// [`handle_connection`] session per connection. Carries no state beyond
/// configuration; all mutable state lives inside sessions.
pub struct Gateway {
    listener: TcpListener,
    config: Arc<Config>,
    cipher: Arc<TokenCipher>,
    hook: Arc<dyn ConnectionHook>,
    filters: Arc<Vec<Box<dyn InstructionFilter>>>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Gateway {
    /// Bind to the configured address.
    pub async fn bind(config: Arc<Config>, shutdown_rx: broadcast::Receiver<()>) -> Result<Self> {
        let cipher = Arc::new(TokenCipher::new(&config.crypt)?);
        let addr = format!(
            "{}:{}",
            config.server.listen_address, config.server.listen_port
        );
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| GatewayError::Internal(format!("failed to bind {}: {}", addr, e)))?;
        info!("Listening on {} (mount path {})", addr, config.server.mount_path);

        Ok(Self {
            listener,
            config,
            cipher,
            hook: Arc::new(AcceptAll),
            filters: Arc::new(Vec::new()),
            shutdown_rx,
        })
    }

    /// Install a connection-settings hook (default: accept everything).
    pub fn with_hook(mut self, hook: Arc<dyn ConnectionHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Install a downstream instruction filter chain (default: empty).
    pub fn with_filters(mut self, filters: Vec<Box<dyn InstructionFilter>>) -> Self {
        self.filters = Arc::new(filters);
        self
    }

    /// The bound address; useful when binding to port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the accept loop until the shutdown signal fires.
    pub async fn run(mut self) -> Result<()> {
        let ctx = Arc::new(SessionContext {
            config: Arc::clone(&self.config),
            cipher: Arc::clone(&self.cipher),
            hook: Arc::clone(&self.hook),
            filters: Arc::clone(&self.filters),
        });

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping accept loop");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "TCP connection accepted");
                            let ctx = Arc::clone(&ctx);
                            tokio::spawn(handle_connection(stream, peer, ctx));
                        }
                        Err(e) => {
                            error!("TCP accept failed: {}", e);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
