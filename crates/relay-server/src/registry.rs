//! Registry of open connections and out-of-band broadcast.

use std::collections::HashMap;
use std::sync::Arc;

use relay_wire::NotificationEnvelope;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::connection::ClientConnection;

/// Owns the set of open connections.
///
/// The set is mutated only on connection open/close and iterated for
/// broadcast; subscription state stays inside each connection.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<ClientConnection>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Add a connection.
    pub async fn add(&self, connection: Arc<ClientConnection>) {
        let mut conns = self.connections.write().await;
        let _ = conns.insert(connection.id.clone(), connection);
    }

    /// Remove a connection by ID.
    pub async fn remove(&self, connection_id: &str) {
        let mut conns = self.connections.write().await;
        let _ = conns.remove(connection_id);
    }

    /// Number of open connections.
    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Send the same text to every open connection.
    pub async fn broadcast(&self, message: &str) {
        let conns = self.connections.read().await;
        debug!(recipients = conns.len(), "broadcasting to all connections");
        for conn in conns.values() {
            if !conn.send(message.to_owned()) {
                warn!(conn_id = %conn.id, "failed to enqueue broadcast");
            }
        }
    }

    /// Broadcast the out-of-band `reconnect` notification.
    ///
    /// Subscription maps are untouched; clients are expected to tear down
    /// and re-establish on their own.
    pub async fn broadcast_reconnect(&self) {
        self.broadcast(&NotificationEnvelope::reconnect().encode())
            .await;
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
