//! # room-relay
//!
//! Room-partitioned WebSocket relay server.
//!
//! ## Features
//! - Password-protected rooms created on first join and dropped when empty
//! - Room-wide `share` broadcasts and directed `whisper`s
//! - Roster (`client_list`) pushed on every membership change
//! - Ping/pong heartbeat that reaps silent connections
//! - Optional TLS, per-IP handshake throttling and Prometheus metrics
//!
//! ## Configuration
//! Environment variables prefixed with `WS_` (a `.env` file is honoured),
//! see [`room_relay::config::ServerConfig`].

use room_relay::{config, server};
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, signal};
use tracing::{error, info};

/// How long shutdown waits for clients to answer the close handshake.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
/// How often idle per-IP rate limiter state is dropped.
const RATE_LIMIT_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Entry point for the relay.
///
/// # Errors
/// Returns an error if configuration validation fails or if the server fails to bind to a port.
#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt::init();

    let config = config::ServerConfig::from_env()?;
    config.validate()?;

    let state = Arc::new(server::ServerState::new(config)?);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", state.config.port)).await?;
    let scheme = if state.tls_acceptor.is_some() { "wss" } else { "ws" };
    info!(
        "✅ WebSocket server running at {}://localhost:{}{}",
        scheme, state.config.port, state.config.root_path
    );

    tokio::spawn(state.heartbeat().run());
    tokio::spawn(state.rate_limiter.clone().prune_periodically(RATE_LIMIT_PRUNE_INTERVAL));
    tokio::spawn({
        let state = state.clone();
        async move {
            if let Err(e) = server::health::serve_metrics_http(state).await {
                error!("Metrics server stopped: {}", e);
            }
        }
    });

    tokio::select! {
        _ = server::accept_connections(listener, state.clone()) => {},
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down gracefully");
            state.shutdown(SHUTDOWN_GRACE).await;
        }
    }

    Ok(())
}
