use thiserror::Error;

/// Represents the errors that can surface from the relay server.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// Represents a transport-level failure.
    ///
    /// This covers failed handshakes, broken reads and TLS errors.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The join handshake was refused before a session existed.
    #[error("Admission rejected: {0}")]
    Admission(#[from] crate::server::directory::AdmissionError),

    /// An inbound payload could not be routed.
    ///
    /// These are reported back to the client and never close the connection.
    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::server::message::ProtocolError),

    /// Queuing a frame on a connection handle failed.
    #[error("Send error: {0}")]
    Send(#[from] crate::server::connection::ConnectionError),

    /// Indicates a failure in serializing or deserializing data.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Represents an error in the server configuration.
    ///
    /// This occurs when an invalid or inconsistent configuration is detected.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// The metrics registry rejected a collector.
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl From<serde_json::Error> for WebSocketError {
    fn from(err: serde_json::Error) -> Self {
        WebSocketError::SerializationError(err.to_string())
    }
}

impl From<tungstenite::Error> for WebSocketError {
    fn from(err: tungstenite::Error) -> Self {
        WebSocketError::ConnectionError(err.to_string())
    }
}

impl From<std::io::Error> for WebSocketError {
    fn from(err: std::io::Error) -> Self {
        WebSocketError::ConnectionError(err.to_string())
    }
}
