pub mod error;

pub use error::WebSocketError;
