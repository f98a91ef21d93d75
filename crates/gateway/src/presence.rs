// Presence Registry
//
// Maps a username to the connection currently speaking for it. The map is a
// back-reference into the connection table: it never owns a connection.

use crate::session::ConnectionId;
use std::collections::HashMap;
use tokio::sync::RwLock;

pub struct PresenceRegistry {
    entries: RwLock<HashMap<String, ConnectionId>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or overwrite; returns the identifier that was superseded, if any
    pub async fn register(&self, username: &str, id: ConnectionId) -> Option<ConnectionId> {
        let mut entries = self.entries.write().await;
        entries.insert(username.to_string(), id)
    }

    pub async fn lookup(&self, username: &str) -> Option<ConnectionId> {
        let entries = self.entries.read().await;
        entries.get(username).cloned()
    }

    /// Compare-and-delete: drops the entry only while it still points at `id`.
    ///
    /// A stale connection closing late must not evict a newer registration
    /// under the same name, so the check and the removal share one write lock.
    pub async fn remove(&self, username: &str, id: &ConnectionId) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get(username) {
            Some(current) if current == id => {
                entries.remove(username);
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
