use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tungstenite::Message;
use uuid::Uuid;

/// Opaque, globally unique identifier assigned to a client at admission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for ClientId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Recoverable errors raised while routing an inbound payload.
///
/// The `Display` text is exactly what the client receives in the
/// `error{message}` reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The payload was not valid JSON (or not UTF-8).
    #[error("Invalid JSON")]
    InvalidJson,

    /// The `type` discriminant is missing or unrecognised.
    #[error("Unknown message type")]
    UnknownType,

    /// A known message type carried missing or ill-typed fields.
    #[error("Invalid {0}")]
    InvalidPayload(String),

    /// A content message arrived before the session joined a room.
    #[error("Join a room first")]
    NotJoined,

    /// An outbound payload could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Messages a client sends to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Liveness acknowledgement.
    Pong,

    /// Replace the sender's display name.
    ChangeName { text: String },

    /// Broadcast to every other room member.
    Share { text: String },

    /// Deliver to a single room member.
    Whisper { to: ClientId, text: String },

    /// Client-side error report.
    Error { message: String },
}

impl ClientMessage {
    const TAGS: [&'static str; 5] = ["pong", "change_name", "share", "whisper", "error"];

    /// Decodes a text payload.
    ///
    /// Malformed JSON, unknown discriminants and known discriminants with bad
    /// fields are reported as distinct [`ProtocolError`]s so the router can
    /// stay total over every input.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_owned);

        serde_json::from_value(value).map_err(|_| match tag {
            Some(tag) if Self::TAGS.contains(&tag.as_str()) => ProtocolError::InvalidPayload(tag),
            _ => ProtocolError::UnknownType,
        })
    }

    /// Decodes a WebSocket data frame. Binary frames must carry UTF-8 JSON.
    pub fn from_frame(frame: &Message) -> Result<Self, ProtocolError> {
        match frame {
            Message::Text(text) => Self::decode(text),
            Message::Binary(data) => {
                let text = std::str::from_utf8(data).map_err(|_| ProtocolError::InvalidJson)?;
                Self::decode(text)
            }
            _ => Err(ProtocolError::InvalidJson),
        }
    }
}

/// One `{id, name}` pair of a room roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub id: ClientId,
    pub name: String,
}

/// Messages the server sends to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Liveness probe; clients answer with `pong`.
    Ping,

    /// A broadcast from another member.
    Share { from: ClientId, text: String },

    /// A directed message from another member.
    Whisper { from: ClientId, text: String },

    /// Something about the last inbound payload was wrong.
    Error { message: String },

    /// Sent once after admission with the assigned id.
    Init {
        #[serde(rename = "clientId")]
        client_id: ClientId,
    },

    /// Current roster of the room.
    ClientList { clients: Vec<RosterEntry> },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error { message: message.into() }
    }

    /// Decodes the `text` of a `share` or `whisper` as a JSON application value.
    ///
    /// # Returns
    /// `None` for every other payload type, otherwise the decode result.
    pub fn decode_text<T: DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        match self {
            ServerMessage::Share { text, .. } | ServerMessage::Whisper { text, .. } => {
                Some(serde_json::from_str(text))
            }
            _ => None,
        }
    }
}

impl From<&ProtocolError> for ServerMessage {
    fn from(err: &ProtocolError) -> Self {
        ServerMessage::error(err.to_string())
    }
}

/// Encodes a `ServerMessage` as a JSON text frame.
impl TryFrom<&ServerMessage> for Message {
    type Error = ProtocolError;

    fn try_from(msg: &ServerMessage) -> Result<Self, Self::Error> {
        serde_json::to_string(msg)
            .map(Message::Text)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Encodes a `ClientMessage` as a JSON text frame.
impl TryFrom<&ClientMessage> for Message {
    type Error = ProtocolError;

    fn try_from(msg: &ClientMessage) -> Result<Self, Self::Error> {
        serde_json::to_string(msg)
            .map(Message::Text)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}
