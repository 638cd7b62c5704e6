//! Wire frames exchanged with clients.

use serde::{Deserialize, Serialize};
use tally_core::SessionId;

/// Request header carrying the client's session id.
pub const SESSION_HEADER: &str = "x-session-id";

/// Inbound text that ends the session.
pub const EXIT_COMMAND: &str = "exit";

/// WebSocket close code for a normal closure.
pub const NORMAL_CLOSURE: u16 = 1000;

/// First frame sent on every connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAck {
    /// Session the connection is bound to.
    pub session_id: SessionId,
    /// Whether saved state was restored.
    pub resumed: bool,
    /// Message count the session starts from.
    pub count: u64,
}

/// Reply to each application message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAck {
    /// Message count after this message.
    pub count: u64,
}

/// Sent before the server closes a connection on exit or shutdown.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Farewell {
    /// Always `true`.
    pub bye: bool,
    /// Final message count.
    pub total: u64,
}

impl Farewell {
    /// Farewell carrying the final count.
    pub fn new(total: u64) -> Self {
        Self { bye: true, total }
    }
}

/// Periodic liveness frame sent to every registered connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "heartbeat", rename_all = "camelCase")]
pub struct Heartbeat {
    /// RFC 3339 send time.
    pub timestamp: String,
    /// Registry size when the sweep started.
    pub active_connections: usize,
}

impl Heartbeat {
    /// Heartbeat stamped with the current UTC time.
    pub fn now(active_connections: usize) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            active_connections,
        }
    }
}
