use crate::net::connection::Connection;
use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use uuid::fmt::Simple;

/// Registry of live connections.
///
/// Connections register on attach and deregister exactly once when their
/// socket closes; shutdown walks the registry to drain everything.
pub struct ConnectionManager {
    conns: Mutex<AHashMap<Simple, Arc<Connection>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            conns: Mutex::new(AHashMap::new()),
        }
    }

    pub(crate) fn register(&self, conn: Arc<Connection>) {
        self.conns.lock().insert(conn.id(), conn);
    }

    pub(crate) fn deregister(&self, id: &Simple) {
        self.conns.lock().remove(id);
    }

    pub fn len(&self) -> usize {
        self.conns.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.lock().is_empty()
    }

    /// Cancel every connection's output channel and wait for the pumps to
    /// drain. Returns true iff all connections closed within `timeout`.
    pub fn walk_and_close_all(&self, timeout: Duration) -> bool {
        let snapshot: Vec<Arc<Connection>> = self.conns.lock().values().cloned().collect();
        for conn in &snapshot {
            conn.cancel_output();
        }

        let deadline = Instant::now() + timeout;
        while !self.is_empty() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        true
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
