// src/server/mod.rs
pub mod connection;
pub mod directory;
pub mod handler;
pub mod health;
pub mod heartbeat;
pub mod message;
pub mod middleware;
pub mod room;
pub mod stream;

// Re-export public components
pub use connection::ConnectionHandle;
pub use directory::{AdmissionError, AdmissionRequest, RoomDirectory};
pub use handler::{accept_connections, handle_connection, Session, SessionState};
pub use health::HealthMetrics;
pub use heartbeat::{HeartbeatMonitor, LivenessTable};
pub use message::{ClientId, ClientMessage, RosterEntry, ServerMessage};
pub use middleware::rate_limit::ConnectionRateLimiter;
pub use room::Room;

use std::{sync::Arc, time::Duration};
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};
use crate::{config::ServerConfig, utils::WebSocketError};

/// Process-wide state, built once at startup and shared by every task.
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<ServerConfig>,
    pub directory: Arc<RoomDirectory>,
    pub liveness: Arc<LivenessTable>,
    pub tls_acceptor: Option<Arc<TlsAcceptor>>,
    pub metrics: HealthMetrics,
    pub rate_limiter: ConnectionRateLimiter,
}

impl ServerState {
    /// Builds fresh state from a configuration.
    ///
    /// # Errors
    /// Fails if the TLS material cannot be loaded or metrics cannot be registered.
    pub fn new(config: ServerConfig) -> Result<Self, WebSocketError> {
        Ok(Self {
            tls_acceptor: config.create_tls_acceptor()?,
            rate_limiter: ConnectionRateLimiter::new(config.connection_rate_limit),
            config: Arc::new(config),
            directory: Arc::new(RoomDirectory::new()),
            liveness: Arc::new(LivenessTable::new()),
            metrics: HealthMetrics::new()?,
        })
    }

    /// Heartbeat monitor over this state's liveness table.
    pub fn heartbeat(&self) -> HeartbeatMonitor {
        HeartbeatMonitor::new(self.liveness.clone(), self.config.heartbeat_interval())
            .with_metrics(self.metrics.clone())
    }

    /// Closes every connection, waiting up to `grace` for the close
    /// handshakes, then terminates whatever is still tracked.
    ///
    /// Sessions clean up their rooms as they end, so once this returns the
    /// directory is empty or about to be.
    pub async fn shutdown(&self, grace: Duration) {
        self.directory.close_all();

        let drained = tokio::time::timeout(grace, async {
            while self.directory.client_count() > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;

        match drained {
            Ok(()) => info!("All connections closed"),
            Err(_) => warn!(
                remaining = self.directory.client_count(),
                "Close handshakes timed out, terminating"
            ),
        }
        self.liveness.terminate_all();
    }
}
