//! Connected-client state and the connection table.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::{RwLock, mpsc};
use tracing::warn;

use hail_core::ids::ConnectionId;
use hail_core::protocol::Event;

/// Maximum total lifetime frame drops before a slow client is evicted.
const MAX_TOTAL_DROPS: u64 = 100;

/// Errors from [`ConnectionTable`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionTableError {
    /// The configured connection limit is reached.
    #[error("connection table at capacity ({limit})")]
    AtCapacity {
        /// The configured limit.
        limit: usize,
    },
}

/// One connected WebSocket client as seen by the server.
pub struct ClientConnection {
    /// Server-assigned channel identity.
    pub id: ConnectionId,
    /// Send channel to the socket's write task.
    tx: mpsc::Sender<Arc<String>>,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Whether any liveness signal arrived since the last heartbeat check.
    pub is_alive: AtomicBool,
    /// When the last heartbeat (or any activity) was observed.
    last_heartbeat: Mutex<Instant>,
    /// Count of frames dropped due to a full send queue.
    pub dropped_frames: AtomicU64,
}

impl ClientConnection {
    /// Create a new connection wrapping the given send channel.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Arc<String>>) -> Self {
        let now = Instant::now();
        Self {
            id,
            tx,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_heartbeat: Mutex::new(now),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Enqueue a pre-serialized frame for the client.
    ///
    /// Returns `false` if the queue is full or closed, and increments the
    /// dropped-frame counter.
    pub fn send(&self, frame: Arc<String>) -> bool {
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Serialize an [`Event`] and enqueue it.
    pub fn send_event(&self, event: &Event) -> bool {
        match serde_json::to_string(event) {
            Ok(json) => self.send(Arc::new(json)),
            Err(_) => false,
        }
    }

    /// Total frames dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Record a liveness signal (heartbeat or any inbound frame).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_heartbeat.lock() = Instant::now();
    }

    /// Duration since the last liveness signal.
    pub fn last_heartbeat_elapsed(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }

    /// Check and reset the alive flag for the heartbeat loop.
    ///
    /// Returns `true` if the connection showed life since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

/// All currently connected clients, indexed by connection identity.
pub struct ConnectionTable {
    connections: RwLock<HashMap<ConnectionId, Arc<ClientConnection>>>,
    /// Atomic counter so count queries never take the read lock.
    active_count: AtomicUsize,
    max_connections: usize,
}

impl ConnectionTable {
    /// Create a table refusing connections beyond `max_connections`.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            active_count: AtomicUsize::new(0),
            max_connections,
        }
    }

    /// Add a connection, refusing at capacity.
    pub async fn add(&self, connection: Arc<ClientConnection>) -> Result<(), ConnectionTableError> {
        let mut conns = self.connections.write().await;
        if conns.len() >= self.max_connections && !conns.contains_key(&connection.id) {
            return Err(ConnectionTableError::AtCapacity {
                limit: self.max_connections,
            });
        }
        if conns.insert(connection.id.clone(), connection).is_none() {
            let _ = self.active_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Remove a connection by identity. Safe to call repeatedly.
    pub async fn remove(&self, connection_id: &ConnectionId) {
        let mut conns = self.connections.write().await;
        if conns.remove(connection_id).is_some() {
            let _ = self.active_count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Look up a connection by identity.
    pub async fn get(&self, connection_id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.read().await.get(connection_id).cloned()
    }

    /// Send an event to one connection.
    ///
    /// Returns `false` if the connection is unknown or its queue rejected
    /// the frame. A client that accumulates [`MAX_TOTAL_DROPS`] drops is
    /// evicted from the table.
    pub async fn send_event_to(&self, connection_id: &ConnectionId, event: &Event) -> bool {
        let Some(conn) = self.get(connection_id).await else {
            return false;
        };
        if conn.send_event(event) {
            return true;
        }
        counter!("ws_send_drops_total").increment(1);
        let drops = conn.drop_count();
        if drops >= MAX_TOTAL_DROPS {
            warn!(conn_id = %conn.id, drops, "evicting slow client");
            self.remove(connection_id).await;
        } else {
            warn!(conn_id = %conn.id, event = event.name(), total_drops = drops, "send queue rejected frame");
        }
        false
    }

    /// Broadcast an event to every connection (used for shutdown notices).
    pub async fn broadcast(&self, event: &Event) {
        let Ok(json) = serde_json::to_string(event) else {
            return;
        };
        let frame = Arc::new(json);
        let conns = self.connections.read().await;
        for conn in conns.values() {
            let _ = conn.send(Arc::clone(&frame));
        }
    }

    /// Number of active connections.
    pub fn count(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }
}
