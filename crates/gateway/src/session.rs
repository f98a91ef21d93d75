// Relay Connection Records
//
// One record per live transport session, keyed by the identifier the server
// assigned on accept. Only the coordinator mutates these.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Opaque identifier of one transport session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Courier,
}

/// Top-level lifecycle state. A closed connection has no record at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Anonymous,
    Registered,
}

/// Live connection
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,

    /// Set by registration
    pub username: Option<String>,

    pub role: Option<Role>,

    /// Only meaningful for couriers
    pub operating_drone: bool,

    pub connected_at: chrono::DateTime<chrono::Utc>,
}

impl Connection {
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            username: None,
            role: None,
            operating_drone: false,
            connected_at: chrono::Utc::now(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        if self.username.is_some() && self.role.is_some() {
            ConnectionState::Registered
        } else {
            ConnectionState::Anonymous
        }
    }

    pub fn is_courier(&self) -> bool {
        self.role == Some(Role::Courier)
    }

    /// A courier who drops mid-flight leaves a drone and orders in limbo
    pub fn needs_crash_recovery(&self) -> bool {
        self.is_courier() && self.operating_drone
    }
}

/// All live connection records
pub struct ConnectionTable {
    connections: RwLock<HashMap<ConnectionId, Connection>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub async fn open(&self, id: ConnectionId) {
        let mut connections = self.connections.write().await;
        connections.insert(id.clone(), Connection::new(id));
    }

    pub async fn get(&self, id: &ConnectionId) -> Option<Connection> {
        let connections = self.connections.read().await;
        connections.get(id).cloned()
    }

    /// Apply `f` to the record; `None` if the connection is gone
    pub async fn update<R>(
        &self,
        id: &ConnectionId,
        f: impl FnOnce(&mut Connection) -> R,
    ) -> Option<R> {
        let mut connections = self.connections.write().await;
        connections.get_mut(id).map(f)
    }

    /// Remove and return the final state of the record
    pub async fn close(&self, id: &ConnectionId) -> Option<Connection> {
        let mut connections = self.connections.write().await;
        connections.remove(id)
    }

    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}
