use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tracing::debug;

/// Per-connection live state.
pub struct ConnectionInfo {
    pub peer: SocketAddr,
    pub connected_at: Instant,
    pub requests: AtomicU64,
}

/// Thread-safe tracker for open client connections and CONNECT tunnels.
///
/// Connections are identified by a monotonically increasing `u64` ID.
pub struct ConnectionTracker {
    next_id: AtomicU64,
    active: DashMap<u64, ConnectionInfo>,
    tunnels: AtomicU64,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            active: DashMap::new(),
            tunnels: AtomicU64::new(0),
        }
    }

    /// Register a new connection and return its unique ID.
    pub fn register(&self, peer: SocketAddr) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.active.insert(
            id,
            ConnectionInfo {
                peer,
                connected_at: Instant::now(),
                requests: AtomicU64::new(0),
            },
        );
        debug!(connection_id = id, peer = %peer, "Connection registered");
        id
    }

    /// Remove a connection by ID (called on disconnect).
    pub fn remove(&self, id: u64) {
        if let Some((_, info)) = self.active.remove(&id) {
            debug!(
                connection_id = id,
                peer = %info.peer,
                duration_secs = info.connected_at.elapsed().as_secs(),
                requests = info.requests.load(Ordering::Relaxed),
                "Connection removed"
            );
        }
    }

    pub fn increment_requests(&self, id: u64) {
        if let Some(entry) = self.active.get(&id) {
            entry.requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of currently open client connections.
    pub fn active_count(&self) -> u64 {
        self.active.len() as u64
    }

    /// Number of CONNECT tunnels currently relaying data.
    pub fn tunnel_count(&self) -> u64 {
        self.tunnels.load(Ordering::Relaxed)
    }

    /// Client connections still in HTTP mode plus upgraded CONNECT tunnels.
    /// This is what `server.max_connections` limits.
    pub fn open_count(&self) -> u64 {
        self.active_count() + self.tunnel_count()
    }

    /// Mark a tunnel as open until the returned guard is dropped.
    pub fn track_tunnel(self: &Arc<Self>) -> TunnelGuard {
        self.tunnels.fetch_add(1, Ordering::Relaxed);
        TunnelGuard {
            tracker: Arc::clone(self),
        }
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TunnelGuard {
    tracker: Arc<ConnectionTracker>,
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        self.tracker.tunnels.fetch_sub(1, Ordering::Relaxed);
    }
}
