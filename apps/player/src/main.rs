//! Lockstep Player - headless synchronized audio player.
//!
//! This binary wires the core engine to a host environment without a GUI:
//! CLI/YAML configuration, env_logger, a logging output sink (platform audio
//! binding is host territory) and Ctrl+C shutdown.

mod config;
mod sink;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use lockstep_core::{Client, ClientOptions, CoreEvent, NetworkClass};
use tokio::signal;

use crate::config::PlayerConfig;
use crate::sink::LoggingSink;

/// Lockstep Player - headless synchronized network audio player.
#[derive(Parser, Debug)]
#[command(name = "lockstep-player")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "LOCKSTEP_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Server host (overrides config file).
    #[arg(short = 's', long, env = "LOCKSTEP_SERVER_HOST")]
    server: Option<String>,

    /// Server port (overrides config file).
    #[arg(short = 'p', long, env = "LOCKSTEP_SERVER_PORT")]
    port: Option<u16>,

    /// Player name (overrides config file).
    #[arg(short, long)]
    name: Option<String>,

    /// Static delay in milliseconds; positive plays later.
    #[arg(short = 'd', long)]
    delay_ms: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Lockstep Player v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        PlayerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(server) = args.server {
        config.server_host = Some(server);
    }
    if let Some(port) = args.port {
        config.server_port = port;
    }
    if let Some(name) = args.name {
        config.name = name;
    }
    if let Some(delay) = args.delay_ms {
        config.static_delay_ms = delay;
    }

    let endpoint = config.to_endpoint().context(
        "No usable server endpoint. Specify --server or set LOCKSTEP_SERVER_HOST to the \
         host of a running server.",
    )?;
    log::info!(
        "Configuration: endpoint={}, policy={:?}, delay={}ms",
        endpoint.id,
        endpoint.policy,
        config.static_delay_ms
    );

    let client = Client::new(ClientOptions {
        config: config.to_core_config(),
        name: config.name.clone(),
        sink: std::sync::Arc::new(LoggingSink::new()),
        signaling_endpoint: config.signaling_url.clone(),
        peer_factory: None,
    });

    // A headless player has no platform network observer; assume a wired
    // class so the local variant is preferred.
    client.network().set_class(NetworkClass::Ethernet);

    // Surface core events in the log.
    let mut events = client.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(CoreEvent::Session(event)) => log::info!("session event: {:?}", event),
                Ok(CoreEvent::Player(event)) => log::info!("player event: {:?}", event),
                Ok(CoreEvent::Stream(event)) => log::debug!("stream event: {:?}", event),
                Ok(CoreEvent::Sync(event)) => log::debug!("sync event: {:?}", event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("event stream lagged by {}", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    client.connect(endpoint).context("Failed to connect")?;
    log::info!("Connecting; press Ctrl+C to stop");

    // Wait for shutdown signal
    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");
    client.shutdown().await;
    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
