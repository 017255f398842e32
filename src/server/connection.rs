use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use futures_util::{stream::SplitSink, Sink, SinkExt};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error};
use tungstenite::Message;

use crate::server::message::ServerMessage;

/// Cheaply cloneable handle onto one client's outbound channel.
///
/// Frames are queued on an unbounded channel and written by a dedicated
/// writer task, so a slow receiver never stalls the caller. Every clone
/// shares the same open/terminated state.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    /// Channel sender feeding the writer task.
    sender: mpsc::UnboundedSender<Message>,
    /// Set once the connection is closed or terminated.
    closed: Arc<AtomicBool>,
    /// Wakes the reading task when the connection is terminated.
    shutdown: Arc<Notify>,
}

impl ConnectionHandle {
    /// Creates a handle together with the receiving end its writer drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = Self {
            sender,
            closed: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        };
        (handle, receiver)
    }

    /// Encodes and queues a server payload.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::Closed` if the connection is no longer open,
    /// `ConnectionError::SendFailed` if the writer has gone away.
    pub fn send(&self, message: &ServerMessage) -> Result<(), ConnectionError> {
        let frame = Message::try_from(message)
            .map_err(|e| ConnectionError::Encode(e.to_string()))?;
        self.send_frame(frame)
    }

    /// Queues an already encoded frame. Used for fan-out so a payload is
    /// serialised once per broadcast.
    pub fn send_frame(&self, frame: Message) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Closed);
        }
        self.sender.send(frame).map_err(|_| ConnectionError::SendFailed)
    }

    /// Checks if the connection is still open.
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.sender.is_closed()
    }

    /// Closes gracefully: queues a close frame, then refuses further sends.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.sender.send(Message::Close(None));
        }
    }

    /// Drops the connection without a close handshake.
    ///
    /// Idempotent. The reading task observes this through [`terminated`](Self::terminated).
    pub fn terminate(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.notify_one();
    }

    /// Resolves once [`terminate`](Self::terminate) has been called.
    pub async fn terminated(&self) {
        self.shutdown.notified().await;
    }
}

/// Drains queued frames into the socket until every handle is dropped or a
/// write fails.
pub async fn write_loop<S>(mut receiver: mpsc::UnboundedReceiver<Message>, mut sink: SplitSink<S, Message>)
where
    S: Sink<Message>,
    S::Error: std::fmt::Display,
{
    while let Some(frame) = receiver.recv().await {
        let closing = matches!(frame, Message::Close(_));
        if let Err(e) = sink.send(frame).await {
            error!("Failed to send message: {}", e);
            break;
        }
        if closing {
            break;
        }
    }
    debug!("Writer finished");
}

/// Represents errors that may occur when queuing a frame.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Connection is closed")]
    Closed,
    #[error("Failed to send message")]
    SendFailed,
    #[error("Failed to encode message: {0}")]
    Encode(String),
}
