//! Per-connection state shared between the handler, the registry, the
//! heartbeat sweep and the shutdown drain.
//!
//! Only the owning handler mutates the message count, the in-flight counter
//! and the closed flag. Everyone else reads them or asks the connection to
//! close through its cancellation token.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;
use tally_core::{ConnectionId, SessionId};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A frame queued for the connection's writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Serialized JSON text frame.
    Text(Arc<String>),
    /// Close frame with the given code; the writer stops after sending it.
    Close(u16),
}

/// Why an outbound send did not reach the queue.
#[derive(Debug, Error)]
pub enum SendError {
    /// The connection is closing or its writer has gone away.
    #[error("connection closed")]
    Closed,
    /// The outbound queue is at capacity.
    #[error("send queue full")]
    Full,
    /// The payload could not be serialized.
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// High bit of the stored count, set once the final total has been reported.
const COUNT_SEALED: u64 = 1 << 63;

/// Serialize a frame once so it can be fanned out to many connections.
pub fn encode<T: Serialize>(frame: &T) -> Result<Arc<String>, SendError> {
    Ok(Arc::new(serde_json::to_string(frame)?))
}

/// One accepted bidirectional stream.
pub struct Connection {
    /// Unique connection ID.
    pub id: ConnectionId,
    session_id: SessionId,
    message_count: AtomicU64,
    in_flight: AtomicUsize,
    closed: AtomicBool,
    tx: mpsc::Sender<OutboundFrame>,
    cancel: CancellationToken,
    /// When this connection was accepted.
    pub connected_at: Instant,
}

impl Connection {
    /// Create a connection bound to `session_id`, starting at `initial_count`.
    pub fn new(
        session_id: SessionId,
        initial_count: u64,
        tx: mpsc::Sender<OutboundFrame>,
    ) -> Self {
        Self {
            id: ConnectionId::new(),
            session_id,
            message_count: AtomicU64::new(initial_count),
            in_flight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            tx,
            cancel: CancellationToken::new(),
            connected_at: Instant::now(),
        }
    }

    /// Session this connection belongs to.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Messages processed so far, including any resumed count.
    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Acquire) & !COUNT_SEALED
    }

    /// Freeze the message count and return it. Later increments are refused,
    /// so the returned total is the one the session ends with.
    pub fn seal_count(&self) -> u64 {
        self.message_count.fetch_or(COUNT_SEALED, Ordering::AcqRel) & !COUNT_SEALED
    }

    /// Messages currently being handled.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Whether disconnect cleanup has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether a close has been requested.
    pub fn is_closing(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token cancelled when the connection is asked to close.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolves once the connection is asked to close.
    pub async fn closing(&self) {
        self.cancel.cancelled().await;
    }

    /// Queue a frame without waiting.
    pub fn send(&self, frame: OutboundFrame) -> Result<(), SendError> {
        if self.is_closed() || self.is_closing() {
            return Err(SendError::Closed);
        }
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Queue a pre-serialized text frame without waiting.
    pub fn send_text(&self, text: Arc<String>) -> Result<(), SendError> {
        self.send(OutboundFrame::Text(text))
    }

    /// Serialize and queue a frame without waiting.
    pub fn send_json<T: Serialize>(&self, frame: &T) -> Result<(), SendError> {
        self.send_text(encode(frame)?)
    }

    /// Serialize and queue a frame, waiting for queue capacity.
    ///
    /// Gives up with [`SendError::Closed`] if the connection is asked to close
    /// while waiting.
    pub async fn send_wait<T: Serialize>(&self, frame: &T) -> Result<(), SendError> {
        let text = encode(frame)?;
        if self.is_closed() || self.is_closing() {
            return Err(SendError::Closed);
        }
        tokio::select! {
            res = self.tx.send(OutboundFrame::Text(text)) => res.map_err(|_| SendError::Closed),
            () = self.cancel.cancelled() => Err(SendError::Closed),
        }
    }

    /// Queue a close frame and signal the connection to stop.
    ///
    /// The token is cancelled even if the close frame cannot be queued.
    pub fn close(&self, code: u16) -> Result<(), SendError> {
        let queued = self.send(OutboundFrame::Close(code));
        self.cancel.cancel();
        queued
    }

    /// Signal the connection to stop without sending anything.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Start handling one message. The in-flight counter drops again when the
    /// returned guard is dropped, on every exit path.
    pub fn begin_message(self: &Arc<Self>) -> InFlightGuard {
        let _ = self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            connection: Arc::clone(self),
        }
    }

    /// Count one processed message and return the new total, or `None` once
    /// the count has been sealed.
    pub(crate) fn try_increment_count(&self) -> Option<u64> {
        self.message_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count & COUNT_SEALED == 0).then_some(count + 1)
            })
            .ok()
            .map(|prev| prev + 1)
    }

    /// Set the closed flag. Returns `true` only for the first call.
    pub(crate) fn mark_closed(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        self.cancel.cancel();
        first
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("message_count", &self.message_count())
            .field("in_flight", &self.in_flight())
            .field("closed", &self.is_closed())
            .field("connected_for", &self.connected_at.elapsed())
            .finish_non_exhaustive()
    }
}

/// Marks one message as in flight for as long as it lives.
#[must_use = "the message is only in flight while the guard is held"]
pub struct InFlightGuard {
    connection: Arc<Connection>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let prev = self.connection.in_flight.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "in-flight counter underflow on {}", self.connection.id);
    }
}
