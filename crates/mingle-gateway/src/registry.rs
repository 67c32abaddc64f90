use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use mingle_types::events::GatewayEvent;

/// Process-wide index of live realtime connections: user id to the set of
/// open connections that user currently holds (one per device or tab).
///
/// One instance per process, handed to session handlers and the dispatcher.
/// The lock only ever covers the map mutation itself — delivery goes
/// through the returned channel senders, so no socket I/O happens under
/// the lock.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<Uuid, HashMap<Uuid, mpsc::UnboundedSender<GatewayEvent>>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a new connection for a user. Returns the connection id and
    /// the receiving end the session task forwards to its socket.
    pub async fn register(&self, user_id: Uuid) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .write()
            .await
            .entry(user_id)
            .or_default()
            .insert(conn_id, tx);
        (conn_id, rx)
    }

    /// Remove a connection. Idempotent: teardown calls this unconditionally
    /// and may race with state that was already cleaned up. Dropping the
    /// last connection removes the user entry entirely, so the map stays
    /// bounded by currently-connected users.
    pub async fn deregister(&self, user_id: Uuid, conn_id: Uuid) {
        let mut map = self.inner.write().await;
        if let Some(conns) = map.get_mut(&user_id) {
            conns.remove(&conn_id);
            if conns.is_empty() {
                map.remove(&user_id);
            }
        }
    }

    /// Snapshot of the user's live connections. Callers iterate the
    /// returned clones without holding the registry lock, so a concurrent
    /// register/deregister cannot invalidate the iteration.
    pub async fn connections_for(&self, user_id: Uuid) -> Vec<mpsc::UnboundedSender<GatewayEvent>> {
        let map = self.inner.read().await;
        map.get(&user_id)
            .map(|conns| conns.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of live connections for a user.
    pub async fn connection_count(&self, user_id: Uuid) -> usize {
        let map = self.inner.read().await;
        map.get(&user_id).map(|conns| conns.len()).unwrap_or(0)
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
