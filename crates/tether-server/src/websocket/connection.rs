//! `WebSocket` client connection state.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tether_core::{ConnectionId, Identity};
use tether_session::Caller;
use tokio::sync::mpsc;

/// A connected status-stream client.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Authenticated user behind the socket.
    pub caller: Caller,
    /// Identity the socket follows.
    pub identity: Identity,
    tx: mpsc::Sender<String>,
    /// When this connection was established.
    pub connected_at: Instant,
    is_alive: AtomicBool,
    last_pong: Mutex<Instant>,
    dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// Create a new connection.
    pub fn new(caller: Caller, identity: Identity, tx: mpsc::Sender<String>) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            caller,
            identity,
            tx,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Queue a text frame for the client.
    ///
    /// Returns `false` if the channel is full or closed, and increments
    /// the dropped message counter.
    pub fn send(&self, message: String) -> bool {
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Mark the connection as alive (pong received).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Duration since the last pong (or connection establishment).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }
}

/// Live connections, for capacity checks and `/health`.
pub struct ConnectionTracker {
    connections: Mutex<HashMap<ConnectionId, Arc<ClientConnection>>>,
    max: usize,
}

impl ConnectionTracker {
    /// Tracker admitting at most `max` connections.
    pub fn new(max: usize) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            max,
        }
    }

    /// Whether another connection would exceed capacity.
    pub fn is_full(&self) -> bool {
        self.connections.lock().len() >= self.max
    }

    /// Register a connection. Returns `false` at capacity.
    pub fn add(&self, connection: Arc<ClientConnection>) -> bool {
        let mut connections = self.connections.lock();
        if connections.len() >= self.max {
            return false;
        }
        let _ = connections.insert(connection.id.clone(), connection);
        true
    }

    /// Forget a connection.
    pub fn remove(&self, id: &ConnectionId) -> bool {
        self.connections.lock().remove(id).is_some()
    }

    /// Number of live connections.
    pub fn count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Number of live connections following `identity`.
    pub fn count_for(&self, identity: &Identity) -> usize {
        self.connections
            .lock()
            .values()
            .filter(|c| &c.identity == identity)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_connection(capacity: usize) -> (Arc<ClientConnection>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = ClientConnection::new(Caller::new("user-1"), Identity::from("op-1"), tx);
        (Arc::new(conn), rx)
    }

    #[tokio::test]
    async fn send_delivers() {
        let (conn, mut rx) = make_connection(4);
        assert!(conn.send("hello".into()));
        assert_eq!(rx.recv().await.unwrap(), "hello");
        assert_eq!(conn.drop_count(), 0);
    }

    #[test]
    fn full_channel_counts_drops() {
        let (conn, _rx) = make_connection(1);
        assert!(conn.send("a".into()));
        assert!(!conn.send("b".into()));
        assert!(!conn.send("c".into()));
        assert_eq!(conn.drop_count(), 2);
    }

    #[test]
    fn heartbeat_flag() {
        let (conn, _rx) = make_connection(1);
        assert!(conn.check_alive());
        assert!(!conn.check_alive());
        conn.mark_alive();
        assert!(conn.check_alive());
        assert!(conn.last_pong_elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn tracker_enforces_capacity() {
        let tracker = ConnectionTracker::new(2);
        let (a, _ra) = make_connection(1);
        let (b, _rb) = make_connection(1);
        let (c, _rc) = make_connection(1);
        assert!(tracker.add(Arc::clone(&a)));
        assert!(tracker.add(b));
        assert!(tracker.is_full());
        assert!(!tracker.add(c));
        assert_eq!(tracker.count(), 2);
        assert_eq!(tracker.count_for(&Identity::from("op-1")), 2);
        assert_eq!(tracker.count_for(&Identity::from("op-2")), 0);

        assert!(tracker.remove(&a.id));
        assert!(!tracker.remove(&a.id));
        assert!(!tracker.is_full());
    }
}
