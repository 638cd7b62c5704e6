//! Time-boxed store for resumable session state.
//!
//! Expiry is lazy: a stale record is only purged by the `get` that finds it.
//! Records that are never read again stay in memory; the key space is bounded
//! by the distinct session ids clients present, which reconnecting clients reuse.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tally_core::SessionId;
use tokio::time::Instant;
use tracing::debug;

/// Default lifetime of a saved session.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(300);

/// State saved when a connection disconnects.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedSession {
    /// Messages processed by the session so far.
    pub count: u64,
}

struct Record<T> {
    created_at: Instant,
    data: T,
}

/// TTL-bounded map from session id to saved state.
pub struct SessionStore<T = SavedSession> {
    ttl: Duration,
    records: Mutex<HashMap<SessionId, Record<T>>>,
}

impl<T: Clone> SessionStore<T> {
    /// Create a store whose records expire after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Record lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store `data` for `session_id`, replacing any previous record.
    pub fn set(&self, session_id: SessionId, data: T) {
        let record = Record {
            created_at: Instant::now(),
            data,
        };
        let _ = self.records.lock().insert(session_id, record);
    }

    /// Fetch the saved data if it is no older than the TTL.
    ///
    /// An expired record is removed as a side effect.
    pub fn get(&self, session_id: &SessionId) -> Option<T> {
        let mut records = self.records.lock();
        let record = records.get(session_id)?;
        if record.created_at.elapsed() <= self.ttl {
            return Some(record.data.clone());
        }
        let _ = records.remove(session_id);
        debug!(%session_id, "expired session record evicted");
        None
    }

    /// Remove the record for `session_id`, if any.
    pub fn delete(&self, session_id: &SessionId) {
        let _ = self.records.lock().remove(session_id);
    }
}

impl<T: Clone> Default for SessionStore<T> {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}
