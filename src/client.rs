//! Reconnecting client for the relay protocol.
//!
//! [`PubSubClient::connect`] spawns a background task that owns the socket.
//! The task answers `ping`s, tracks the assigned id and the peer list, and
//! forwards every server payload as a [`ClientEvent`]. When the connection
//! drops it waits for the [`ReconnectPolicy`] delay and replays the join
//! handshake with the same room, password and name, indefinitely, until
//! [`PubSubClient::close`] is called.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::{
    net::TcpStream,
    sync::mpsc::{self, error::TryRecvError},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use tungstenite::Message;
use url::Url;

use crate::server::message::{ClientId, ClientMessage, RosterEntry, ServerMessage};

/// Delay schedule between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor per consecutive failed attempt; `1` keeps the delay fixed.
    pub multiplier: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(1))
    }
}

impl ReconnectPolicy {
    /// The same delay before every attempt.
    pub fn fixed(delay: Duration) -> Self {
        Self { initial_delay: delay, max_delay: delay, multiplier: 1 }
    }

    /// Doubling delay starting at `initial`, capped at `max`.
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self { initial_delay: initial, max_delay: max.max(initial), multiplier: 2 }
    }

    /// Delay before reconnect attempt number `attempt` (zero based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Where and as whom to connect.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server base URL, e.g. `ws://localhost:8080/`.
    pub url: Url,
    pub room: String,
    pub password: String,
    pub name: String,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    pub fn new(
        url: Url,
        room: impl Into<String>,
        password: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            url,
            room: room.into(),
            password: password.into(),
            name: name.into(),
            reconnect: ReconnectPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// The base URL with `room`, `password` and `name` query parameters.
    pub fn join_url(&self) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .clear()
            .append_pair("room", &self.room)
            .append_pair("password", &self.password)
            .append_pair("name", &self.name);
        url
    }
}

/// Notifications emitted by the background task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The join handshake succeeded.
    Connected,
    /// A payload from the server, `ping` included.
    Message(ServerMessage),
    /// The connection dropped; a reconnect is scheduled unless closing.
    Disconnected,
}

#[derive(Debug, Default)]
struct ClientState {
    client_id: Option<ClientId>,
    peers: Vec<RosterEntry>,
}

enum Command {
    Send(ClientMessage),
    Close,
}

enum SessionEnd {
    Dropped,
    Shutdown,
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Handle to a running client.
pub struct PubSubClient {
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<Mutex<ClientState>>,
    task: JoinHandle<()>,
}

impl PubSubClient {
    /// Starts connecting in the background and returns the event stream.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Arguments
    /// * `config` - Server URL, credentials and reconnect policy.
    ///
    /// # Returns
    /// * The client handle, used to send payloads and read local state.
    /// * The receiver of [`ClientEvent`]s. It yields `None` once the client
    ///   has been closed.
    pub fn connect(config: ClientConfig) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(ClientState::default()));

        let task = tokio::spawn(run(config, command_rx, events, state.clone()));
        (Self { commands, state, task }, event_rx)
    }

    /// Id assigned by the server on the current connection.
    pub fn client_id(&self) -> Option<ClientId> {
        lock(&self.state).client_id.clone()
    }

    /// Latest roster received.
    pub fn peers(&self) -> Vec<RosterEntry> {
        lock(&self.state).peers.clone()
    }

    /// Queues a raw payload. Payloads issued while disconnected are dropped.
    pub fn send(&self, message: ClientMessage) {
        if self.commands.send(Command::Send(message)).is_err() {
            debug!("Client task has stopped; message dropped");
        }
    }

    pub fn share(&self, text: impl Into<String>) {
        self.send(ClientMessage::Share { text: text.into() });
    }

    pub fn whisper(&self, to: ClientId, text: impl Into<String>) {
        self.send(ClientMessage::Whisper { to, text: text.into() });
    }

    /// Shares an application value, JSON-encoded into the `text` field.
    ///
    /// Receivers decode it with [`ServerMessage::decode_text`].
    ///
    /// # Errors
    /// Returns the serialization error if `value` cannot be encoded; nothing is sent then.
    pub fn share_json<T: Serialize>(&self, value: &T) -> Result<(), serde_json::Error> {
        self.share(serde_json::to_string(value)?);
        Ok(())
    }

    /// Whispers an application value, JSON-encoded into the `text` field.
    ///
    /// # Errors
    /// Returns the serialization error if `value` cannot be encoded; nothing is sent then.
    pub fn whisper_json<T: Serialize>(&self, to: ClientId, value: &T) -> Result<(), serde_json::Error> {
        self.whisper(to, serde_json::to_string(value)?);
        Ok(())
    }

    pub fn change_name(&self, name: impl Into<String>) {
        self.send(ClientMessage::ChangeName { text: name.into() });
    }

    /// Closes the connection, stops reconnecting and clears local state.
    pub async fn close(self) {
        let _ = self.commands.send(Command::Close);
        if let Err(e) = self.task.await {
            error!("Client task failed: {}", e);
        }
        *lock(&self.state) = ClientState::default();
    }
}

fn lock(state: &Mutex<ClientState>) -> MutexGuard<'_, ClientState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn run(
    config: ClientConfig,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
    state: Arc<Mutex<ClientState>>,
) {
    let url = config.join_url();
    let mut attempt = 0;

    loop {
        match connect_async(url.as_str()).await {
            Ok((mut socket, _)) => {
                attempt = 0;
                info!(room = %config.room, "Connected");
                // anything sent while offline is stale, but a close still counts
                loop {
                    match commands.try_recv() {
                        Ok(Command::Send(_)) => continue,
                        Err(TryRecvError::Empty) => break,
                        Ok(Command::Close) | Err(TryRecvError::Disconnected) => {
                            let _ = socket.close(None).await;
                            return;
                        }
                    }
                }
                let _ = events.send(ClientEvent::Connected);

                let end = session(socket, &mut commands, &events, &state).await;

                *lock(&state) = ClientState::default();
                let _ = events.send(ClientEvent::Disconnected);
                if let SessionEnd::Shutdown = end {
                    return;
                }
                warn!("Connection closed. Attempting to reconnect...");
            }
            Err(e) => warn!("Connection attempt failed: {}", e),
        }

        let delay = config.reconnect.delay(attempt);
        attempt = attempt.saturating_add(1);
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                command = commands.recv() => match command {
                    None | Some(Command::Close) => return,
                    Some(Command::Send(_)) => debug!("Not connected; message dropped"),
                },
            }
        }
    }
}

async fn session(
    mut socket: Socket,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    events: &mpsc::UnboundedSender<ClientEvent>,
    state: &Mutex<ClientState>,
) -> SessionEnd {
    loop {
        tokio::select! {
            frame = socket.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    // malformed payloads are dropped silently
                    let Ok(payload) = serde_json::from_str::<ServerMessage>(&text) else {
                        continue;
                    };
                    if handle_payload(&mut socket, &payload, state).await.is_err() {
                        return SessionEnd::Dropped;
                    }
                    let _ = events.send(ClientEvent::Message(payload));
                }
                Some(Ok(Message::Close(_))) | None => return SessionEnd::Dropped,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    let _ = socket.close(None).await;
                    return SessionEnd::Dropped;
                }
            },
            command = commands.recv() => match command {
                Some(Command::Send(message)) => {
                    let frame = match Message::try_from(&message) {
                        Ok(frame) => frame,
                        Err(e) => {
                            error!("Failed to encode payload: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = socket.send(frame).await {
                        error!("WebSocket error: {}", e);
                        let _ = socket.close(None).await;
                        return SessionEnd::Dropped;
                    }
                }
                None | Some(Command::Close) => {
                    let _ = socket.close(None).await;
                    return SessionEnd::Shutdown;
                }
            },
        }
    }
}

async fn handle_payload(
    socket: &mut Socket,
    payload: &ServerMessage,
    state: &Mutex<ClientState>,
) -> Result<(), tungstenite::Error> {
    match payload {
        ServerMessage::Ping => {
            if let Ok(pong) = Message::try_from(&ClientMessage::Pong) {
                socket.send(pong).await?;
            }
        }
        ServerMessage::Init { client_id } => {
            lock(state).client_id = Some(client_id.clone());
        }
        ServerMessage::ClientList { clients } => {
            lock(state).peers = clients.clone();
        }
        ServerMessage::Error { message } => error!("Server error: {}", message),
        ServerMessage::Share { .. } | ServerMessage::Whisper { .. } => {}
    }
    Ok(())
}
