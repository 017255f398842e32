use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use axum::{Router, routing::get, extract::State, http::StatusCode, response::IntoResponse};
use std::{net::SocketAddr, sync::Arc};
use tracing::{error, info};

use crate::{server::ServerState, utils::WebSocketError};

/// Prometheus metrics for the relay.
#[derive(Clone)]
pub struct HealthMetrics {
    /// Tracks the number of open WebSocket sessions.
    pub connections: IntGauge,
    /// Number of live rooms, sampled from the directory on every scrape.
    pub rooms: IntGauge,
    /// Counts inbound frames across all sessions.
    pub messages_received: IntCounter,
    /// Counts refused join handshakes.
    pub admissions_rejected: IntCounter,
    /// Counts connections terminated by the heartbeat monitor.
    pub connections_reaped: IntCounter,
    registry: Registry,
}

impl HealthMetrics {
    /// Creates the metrics and registers them with a private registry.
    ///
    /// # Errors
    /// Returns the Prometheus error if a collector cannot be registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let connections = IntGauge::new("connections", "Active connections")?;
        let rooms = IntGauge::new("rooms", "Live rooms")?;
        let messages_received = IntCounter::new("messages_received", "Total messages received")?;
        let admissions_rejected = IntCounter::new("admissions_rejected", "Refused join handshakes")?;
        let connections_reaped = IntCounter::new("connections_reaped", "Connections terminated by heartbeat")?;

        registry.register(Box::new(connections.clone()))?;
        registry.register(Box::new(rooms.clone()))?;
        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(admissions_rejected.clone()))?;
        registry.register(Box::new(connections_reaped.clone()))?;

        Ok(Self {
            connections,
            rooms,
            messages_received,
            admissions_rejected,
            connections_reaped,
            registry,
        })
    }

    /// Encodes every registered metric in the Prometheus text format.
    pub fn expose_metrics(&self) -> Result<String, WebSocketError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| WebSocketError::SerializationError(e.to_string()))
    }
}

/// Builds the `/metrics` and `/health` router.
pub fn metrics_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

/// Serves the metrics router on the configured metrics port.
///
/// # Errors
/// Returns `WebSocketError::ConnectionError` if the HTTP server fails.
pub async fn serve_metrics_http(state: Arc<ServerState>) -> Result<(), WebSocketError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.metrics_port));
    info!("Metrics available at http://{}/metrics", addr);

    axum::Server::bind(&addr)
        .serve(metrics_router(state).into_make_service())
        .await
        .map_err(|e| WebSocketError::ConnectionError(e.to_string()))
}

async fn metrics_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    state.metrics.rooms.set(state.directory.room_count() as i64);
    match state.metrics.expose_metrics() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
