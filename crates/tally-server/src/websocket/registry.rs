//! Live connection set.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tally_core::ConnectionId;

use super::connection::Connection;

/// Concurrency-safe set of registered connections.
///
/// The lock is never held across an `.await`; consumers iterate a
/// [`snapshot`](Self::snapshot), never the live map.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. Returns `false` if it was already registered.
    pub fn register(&self, connection: Arc<Connection>) -> bool {
        let mut conns = self.connections.write();
        if conns.contains_key(&connection.id) {
            return false;
        }
        let _ = conns.insert(connection.id.clone(), connection);
        true
    }

    /// Remove a connection. Returns `false` if it was not registered.
    pub fn deregister(&self, id: &ConnectionId) -> bool {
        self.connections.write().remove(id).is_some()
    }

    /// Whether a connection is currently registered.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.read().contains_key(id)
    }

    /// Point-in-time copy of the membership, safe to iterate while the
    /// registry keeps changing.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    /// Current membership count.
    pub fn size(&self) -> usize {
        self.connections.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::SessionId;
    use tokio::sync::mpsc;

    fn make_connection(session: &str) -> Arc<Connection> {
        let (tx, _rx) = mpsc::channel(4);
        Arc::new(Connection::new(SessionId::from(session), 0, tx))
    }

    #[test]
    fn register_and_size() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.size(), 0);
        assert!(registry.register(make_connection("a")));
        assert!(registry.register(make_connection("b")));
        assert_eq!(registry.size(), 2);
    }

    #[test]
    fn duplicate_register_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let conn = make_connection("a");
        assert!(registry.register(Arc::clone(&conn)));
        assert!(!registry.register(conn));
        assert_eq!(registry.size(), 1);
    }

    #[test]
    fn deregister_twice_is_noop() {
        let registry = ConnectionRegistry::new();
        let conn = make_connection("a");
        let _ = registry.register(Arc::clone(&conn));
        assert!(registry.deregister(&conn.id));
        assert!(!registry.deregister(&conn.id));
        assert_eq!(registry.size(), 0);
        assert!(!registry.contains(&conn.id));
    }

    #[test]
    fn shared_session_id_is_allowed() {
        let registry = ConnectionRegistry::new();
        let _ = registry.register(make_connection("same"));
        let _ = registry.register(make_connection("same"));
        assert_eq!(registry.size(), 2);
    }

    #[test]
    fn snapshot_is_detached_from_live_set() {
        let registry = ConnectionRegistry::new();
        let a = make_connection("a");
        let _ = registry.register(Arc::clone(&a));
        let snap = registry.snapshot();

        let _ = registry.register(make_connection("b"));
        let _ = registry.deregister(&a.id);

        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].id, a.id);
        assert_eq!(registry.size(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_register_deregister_snapshot() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let conn = make_connection(&format!("s{i}"));
                    let _ = registry.register(Arc::clone(&conn));
                    let _ = registry.snapshot();
                    let _ = registry.deregister(&conn.id);
                }
                let _ = registry.register(make_connection(&format!("kept{i}")));
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(registry.size(), 16);
        assert_eq!(registry.snapshot().len(), 16);
    }
}
