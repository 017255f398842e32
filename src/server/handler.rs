use std::{net::SocketAddr, sync::Arc, time::Duration};
use futures_util::StreamExt;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    time::timeout,
};
use tokio_tungstenite::accept_hdr_async;
use tracing::{debug, error, info, instrument, warn};
use tungstenite::{
    handshake::server::{ErrorResponse, Request, Response},
    Message,
};

use crate::{
    config::ServerConfig,
    server::{
        connection::{write_loop, ConnectionHandle},
        directory::{AdmissionError, AdmissionRequest, RoomDirectory},
        heartbeat::LivenessTable,
        message::{ClientId, ClientMessage, ProtocolError, ServerMessage},
        middleware::validate_message,
        room::Room,
        stream::{read_request_head, write_rejection, PrefixedStream, RequestHead},
        ServerState,
    },
    utils::error::WebSocketError,
};

/// How long a peer may take to send its request head.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Upgrade in progress; no room yet.
    Connecting,
    /// Admitted into a room.
    Joined { client_id: ClientId, room: String },
    /// Disconnected or rejected.
    Closed,
}

/// Per-connection message router.
///
/// Owns the session state machine and maps inbound payloads to room
/// operations. Protocol errors are answered on the same connection and never
/// change state.
pub struct Session {
    state: SessionState,
    handle: ConnectionHandle,
    directory: Arc<RoomDirectory>,
    liveness: Arc<LivenessTable>,
}

impl Session {
    pub fn new(
        handle: ConnectionHandle,
        directory: Arc<RoomDirectory>,
        liveness: Arc<LivenessTable>,
    ) -> Self {
        Self {
            state: SessionState::Connecting,
            handle,
            directory,
            liveness,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn client_id(&self) -> Option<&ClientId> {
        match &self.state {
            SessionState::Joined { client_id, .. } => Some(client_id),
            _ => None,
        }
    }

    /// `Connecting -> Joined` on success, `Connecting -> Closed` on rejection.
    ///
    /// Queues `init{clientId}` ahead of the roster sync the admission triggers.
    pub fn admit(&mut self, request: &AdmissionRequest) -> Result<ClientId, AdmissionError> {
        if self.state != SessionState::Connecting {
            return Err(AdmissionError::AlreadyJoined);
        }

        let client_id = ClientId::generate();
        if let Err(e) = self.handle.send(&ServerMessage::Init { client_id: client_id.clone() }) {
            debug!("Init not queued: {}", e);
        }

        match self.directory.admit(request, client_id.clone(), self.handle.clone()) {
            Ok(_) => {
                self.liveness.register(client_id.clone(), self.handle.clone());
                self.state = SessionState::Joined {
                    client_id: client_id.clone(),
                    room: request.room.clone(),
                };
                Ok(client_id)
            }
            Err(e) => {
                self.state = SessionState::Closed;
                Err(e)
            }
        }
    }

    /// Handles one inbound WebSocket frame.
    ///
    /// Any frame counts as liveness traffic. Data frames are decoded and
    /// routed; failures are answered with `error{message}`.
    pub fn receive(&mut self, frame: &Message) {
        if let Some(id) = self.client_id() {
            self.liveness.touch(id);
        }

        match frame {
            Message::Text(_) | Message::Binary(_) => {
                if let Err(e) = ClientMessage::from_frame(frame).and_then(|msg| self.route(msg)) {
                    warn!("Rejected payload: {}", e);
                    if let Err(e) = self.handle.send(&ServerMessage::from(&e)) {
                        debug!("Error reply not delivered: {}", e);
                    }
                }
            }
            _ => {}
        }
    }

    /// Dispatches a decoded payload to the joined room.
    pub fn route(&mut self, msg: ClientMessage) -> Result<(), ProtocolError> {
        validate_message(&msg)?;

        match msg {
            ClientMessage::Pong => Ok(()),
            ClientMessage::Error { message } => {
                warn!(client = ?self.client_id(), "Client reported error: {}", message);
                Ok(())
            }
            ClientMessage::ChangeName { text } => {
                let (id, room) = self.joined_room()?;
                room.rename(&id, text).map_err(|_| ProtocolError::NotJoined)
            }
            ClientMessage::Share { text } => {
                let (id, room) = self.joined_room()?;
                let delivered = room.broadcast(&id, &text);
                debug!(client = %id, delivered, "Share relayed");
                Ok(())
            }
            ClientMessage::Whisper { to, text } => {
                let (id, room) = self.joined_room()?;
                room.whisper(&id, &to, &text);
                Ok(())
            }
        }
    }

    /// `Joined -> Closed`: leaves the room (dropping it if empty) and stops
    /// liveness tracking. Idempotent.
    pub fn close(&mut self) {
        if let SessionState::Joined { client_id, room } =
            std::mem::replace(&mut self.state, SessionState::Closed)
        {
            self.liveness.remove(&client_id);
            self.directory.leave(&client_id);
            info!(room = %room, client = %client_id, "Client left");
        }
    }

    fn joined_room(&self) -> Result<(ClientId, Arc<Room>), ProtocolError> {
        match &self.state {
            SessionState::Joined { client_id, room } => {
                let room = self.directory.room(room).map_err(|_| ProtocolError::NotJoined)?;
                Ok((client_id.clone(), room))
            }
            _ => Err(ProtocolError::NotJoined),
        }
    }
}

/// Accepts TCP connections forever, upgrading to TLS first when configured.
pub async fn accept_connections(listener: TcpListener, state: Arc<ServerState>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    let result = match &state.tls_acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => handle_connection(tls_stream, addr, state.clone()).await,
                            Err(e) => Err(WebSocketError::ConnectionError(format!(
                                "TLS handshake failed: {}", e
                            ))),
                        },
                        None => handle_connection(stream, addr, state.clone()).await,
                    };
                    match result {
                        Ok(()) => debug!("Connection closed: {}", addr),
                        Err(WebSocketError::Admission(e)) => debug!("Rejected {}: {}", addr, e),
                        Err(e) => error!("Connection error from {}: {}", addr, e),
                    }
                });
            }
            Err(e) => error!("Accept error: {}", e),
        }
    }
}

/// Runs one connection from upgrade to disconnect.
///
/// The request head is screened first: anything that is not a `GET` on the
/// root path, or not a WebSocket upgrade, is answered with a plain HTTP
/// status. Admission then happens inside the upgrade callback so that
/// rejections are answered with an HTTP status instead of an upgraded socket.
///
/// # Arguments
/// * `stream` - The accepted transport, TLS already negotiated if enabled.
/// * `addr` - Peer address, used for rate limiting.
/// * `state` - Shared server state.
///
/// # Errors
/// Returns `WebSocketError::Admission` when the join is refused and
/// `WebSocketError::ConnectionError` on transport failures.
#[instrument(skip(stream, state))]
pub async fn handle_connection<S>(
    mut stream: S,
    addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), WebSocketError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    state.rate_limiter.throttle(addr.ip()).await;

    let (head, buffered) = timeout(HANDSHAKE_TIMEOUT, read_request_head(&mut stream))
        .await
        .map_err(|_| WebSocketError::ConnectionError("Timed out reading request head".into()))??;

    if let Err(reason) = screen_request(&head, &state.config, &state.directory) {
        state.metrics.admissions_rejected.inc();
        if let Err(e) = write_rejection(&mut stream, &reason).await {
            debug!("Rejection not delivered: {}", e);
        }
        return Err(reason.into());
    }
    let stream = PrefixedStream::new(buffered, stream);

    let (handle, outbound) = ConnectionHandle::channel();
    let mut session = Session::new(handle.clone(), state.directory.clone(), state.liveness.clone());
    let mut rejection = None;

    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let admitted = AdmissionRequest::from_query(request.uri().query())
            .and_then(|admission| session.admit(&admission));

        match admitted {
            Ok(_) => Ok(response),
            Err(e) => {
                let reply = reject(&e);
                rejection = Some(e);
                Err(reply)
            }
        }
    };

    let accepted = accept_hdr_async(stream, callback).await;
    let ws_stream = match accepted {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            session.close();
            return Err(match rejection {
                Some(reason) => {
                    state.metrics.admissions_rejected.inc();
                    reason.into()
                }
                None => WebSocketError::ConnectionError(e.to_string()),
            });
        }
    };

    let (sink, mut reader) = ws_stream.split();
    let writer = tokio::spawn(write_loop(outbound, sink));
    state.metrics.connections.inc();

    let result = loop {
        tokio::select! {
            _ = handle.terminated() => break Ok(()),
            frame = reader.next() => match frame {
                Some(Ok(frame)) => {
                    state.metrics.messages_received.inc();
                    session.receive(&frame);
                }
                Some(Err(e)) => break Err(WebSocketError::ConnectionError(e.to_string())),
                None => break Ok(()),
            },
        }
    };

    let terminated = !handle.is_open();
    session.close();
    state.metrics.connections.dec();
    drop(session);
    drop(handle);

    if terminated {
        writer.abort();
    } else if let Err(e) = writer.await {
        debug!("Writer task ended abnormally: {}", e);
    }

    result
}

/// Decides whether a request head may proceed to the WebSocket handshake.
///
/// # Returns
/// * `Ok(())` for an upgrade `GET` on the root path.
/// * `Err(PathNotFound)` for any other method or path.
/// * For a plain `GET` on the root, the first credential problem the join
///   would hit, or `UpgradeFailed` when the credentials are fine.
pub fn screen_request(
    head: &RequestHead,
    config: &ServerConfig,
    directory: &RoomDirectory,
) -> Result<(), AdmissionError> {
    if head.method != "GET" || !config.matches_root(head.path()) {
        return Err(AdmissionError::PathNotFound);
    }
    if head.upgrade {
        return Ok(());
    }

    let request = AdmissionRequest::from_query(head.query())?;
    match directory.room(&request.room) {
        Ok(room) if !room.password_matches(&request.password) => Err(AdmissionError::IncorrectPassword),
        _ => Err(AdmissionError::UpgradeFailed),
    }
}

fn reject(reason: &AdmissionError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = reason.status();
    response
}
