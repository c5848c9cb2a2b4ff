//! guacgate - WebSocket gateway for guacd
//!
//! This binary bridges browser-side Guacamole clients to a guacd daemon:
//! - Authenticates clients via an encrypted connection token in the URL
//! - Performs the guacd protocol handshake per connection
//! - Relays Guacamole instructions in both directions

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};

use guacgate::{load_config, Gateway, Result};

#[derive(Parser)]
#[command(name = "guacgate")]
#[command(version)]
#[command(about = "WebSocket gateway bridging Guacamole clients to guacd")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Override listen address
    #[arg(long)]
    listen_address: Option<String>,

    /// Override listen port
    #[arg(long)]
    listen_port: Option<u16>,

    /// Enable verbose/debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // Priority: --verbose flag, then RUST_LOG env var, then config default
    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string())
    };
    tracing_subscriber::fmt().with_env_filter(&log_level).init();

    info!("Starting guacgate v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = load_config(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    // Apply CLI overrides
    if let Some(addr) = cli.listen_address {
        config.server.listen_address = addr;
    }
    if let Some(port) = cli.listen_port {
        config.server.listen_port = port;
    }

    let config = Arc::new(config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

    let gateway = Gateway::bind(Arc::clone(&config), shutdown_rx).await?;
    info!(
        "Gateway ready: ws://{}:{}{} -> guacd {}:{}",
        config.server.listen_address,
        config.server.listen_port,
        config.server.mount_path,
        config.guacd.host,
        config.guacd.port,
    );

    // Spawn the accept loop
    let gateway_handle = tokio::spawn(async move {
        if let Err(e) = gateway.run().await {
            error!("Gateway error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => { sigterm.recv().await; }
                    Err(e) => {
                        error!("Failed to install SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    // Send shutdown signal and wait for the accept loop to stop
    let _ = shutdown_tx.send(());
    let _ = gateway_handle.await;

    info!("Shutdown complete");
    Ok(())
}
