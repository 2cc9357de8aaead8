//! Registry of live connections.
//!
//! `SessionRegistry` stores non-owning weak references to connection
//! outbound handles alongside the endpoint facts the administrative
//! surface reports, allowing the `/sys/connections` snapshot to be taken
//! without preventing connection cleanup. Dead entries can be pruned
//! opportunistically or lazily at snapshot time.

use std::{net::SocketAddr, sync::Weak};

use dashmap::DashMap;
use tokio::time::Instant;

use crate::outbound::{FrameHandle, FrameHandleInner};

/// Identifier assigned to a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl From<u64> for ConnectionId {
    fn from(value: u64) -> Self { Self(value) }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Endpoint facts recorded when a connection is established.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionInfo {
    /// Peer address.
    pub remote: SocketAddr,
    /// Local address of the accepting socket.
    pub local: SocketAddr,
    /// When the transport accepted the connection.
    pub connected_at: Instant,
}

struct Entry {
    info: ConnectionInfo,
    liveness: Weak<FrameHandleInner>,
}

/// One row of the `/sys/connections` listing.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionSnapshot {
    /// Peer address.
    pub remote: SocketAddr,
    /// Local address.
    pub local: SocketAddr,
    /// Microseconds the connection has been online.
    pub us_online: u64,
}

/// Concurrent registry of live connections keyed by [`ConnectionId`].
#[derive(Default)]
pub struct SessionRegistry(DashMap<ConnectionId, Entry>);

impl SessionRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Insert a newly established connection.
    pub fn insert(&self, id: ConnectionId, info: ConnectionInfo, handle: &FrameHandle) {
        self.0.insert(
            id,
            Entry {
                info,
                liveness: handle.downgrade(),
            },
        );
    }

    /// Remove a connection, typically on teardown.
    pub fn remove(&self, id: ConnectionId) { self.0.remove(&id); }

    /// Drop entries whose connections have terminated.
    pub fn prune(&self) { self.0.retain(|_, entry| entry.liveness.strong_count() > 0); }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0
            .iter()
            .filter(|entry| entry.liveness.strong_count() > 0)
            .count()
    }

    /// Whether no live connections remain.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Point-in-time listing of live connections.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let now = Instant::now();
        self.0
            .iter()
            .filter(|entry| entry.liveness.strong_count() > 0)
            .map(|entry| ConnectionSnapshot {
                remote: entry.info.remote,
                local: entry.info.local,
                us_online: now
                    .saturating_duration_since(entry.info.connected_at)
                    .as_micros() as u64,
            })
            .collect()
    }
}
