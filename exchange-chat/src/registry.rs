use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::{Mutex, mpsc};
use tracing::info;

pub type ConnectionId = u64;

/// Display name used when a client does not pick one.
pub const DEFAULT_NAME: &str = "User";

/// Returned when the connection's writer has already gone away.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("connection outbound channel closed")]
pub struct SendFailed;

/// One live client session.
///
/// Cloning a handle shares the same outbound channel; identity is the `id`.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    name: String,
    peer: Option<SocketAddr>,
    outbound: mpsc::UnboundedSender<String>,
}

impl ConnectionHandle {
    pub fn new(
        id: ConnectionId,
        name: impl Into<String>,
        peer: Option<SocketAddr>,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            peer,
            outbound,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Queues a message for this client without waiting on the socket.
    pub fn send(&self, message: impl Into<String>) -> Result<(), SendFailed> {
        self.outbound.send(message.into()).map_err(|_| SendFailed)
    }
}

/// Set of connections currently between registration and unregistration.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Adds a handle.
    ///
    /// # Panics
    /// If a handle with the same id is already registered. Ids come from
    /// [`ConnectionRegistry::next_id`], so this only fires on a logic error.
    pub async fn register(&self, handle: ConnectionHandle) {
        let mut connections = self.connections.lock().await;
        let id = handle.id;
        let peer = handle.peer;
        let name = handle.name.clone();
        let previous = connections.insert(id, handle);
        assert!(previous.is_none(), "connection {id} registered twice");
        info!(id, ?peer, %name, online = connections.len(), "client connects");
    }

    /// Removes a handle if present. Returns whether anything was removed.
    pub async fn unregister(&self, id: ConnectionId) -> bool {
        let mut connections = self.connections.lock().await;
        match connections.remove(&id) {
            Some(handle) => {
                info!(
                    id,
                    peer = ?handle.peer,
                    name = %handle.name,
                    online = connections.len(),
                    "client disconnects"
                );
                true
            }
            None => false,
        }
    }

    /// Clones the current membership so callers can iterate without the lock.
    pub async fn snapshot(&self) -> Vec<ConnectionHandle> {
        self.connections.lock().await.values().cloned().collect()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.connections.lock().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
