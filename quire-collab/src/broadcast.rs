//! Fan-out of one room's frames to every connection but the sender.
//!
//! Uses a tokio broadcast channel for O(1) send to all subscribers. Each
//! connection gets an independent receiver that buffers up to `capacity`
//! frames; a connection that falls further behind sees `Lagged` and must
//! resynchronize through the state-vector handshake.
//!
//! The group is owned by its room task, so membership needs no lock. Stats
//! are atomics so connection tasks can report lag without going through the
//! room.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::protocol::{ProtocolError, SyncMessage};

/// Process-unique id of one WebSocket connection.
pub type ConnectionId = u64;

/// An encoded frame plus the connection it came from.
#[derive(Debug)]
pub struct Frame {
    /// `None` for frames produced by the coordinator itself.
    pub origin: Option<ConnectionId>,
    pub bytes: Vec<u8>,
}

impl Frame {
    /// Whether `connection` should forward this frame to its socket.
    pub fn is_for(&self, connection: ConnectionId) -> bool {
        self.origin != Some(connection)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub members: usize,
}

#[derive(Debug, Default)]
struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Handle connection tasks use to report frames lost to lag.
#[derive(Debug, Clone)]
pub struct LagReporter(Arc<AtomicBroadcastStats>);

impl LagReporter {
    pub fn record(&self, skipped: u64) {
        self.0.frames_dropped.fetch_add(skipped, Ordering::Relaxed);
    }
}

/// Broadcast group for a single document room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Frame>>,
    /// Connected members and the identity they authenticated as.
    members: HashMap<ConnectionId, String>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` bounds how many frames a slow member may fall behind.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: HashMap::new(),
            capacity,
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Add a member and return its receiver.
    pub fn add_member(&mut self, connection: ConnectionId, identity: impl Into<String>) -> broadcast::Receiver<Arc<Frame>> {
        self.members.insert(connection, identity.into());
        self.sender.subscribe()
    }

    /// Remove a member. Its receiver stays valid until dropped.
    pub fn remove_member(&mut self, connection: ConnectionId) -> Option<String> {
        self.members.remove(&connection)
    }

    pub fn has_member(&self, connection: ConnectionId) -> bool {
        self.members.contains_key(&connection)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members and their identities.
    pub fn members(&self) -> impl Iterator<Item = (ConnectionId, &str)> + '_ {
        self.members.iter().map(|(c, id)| (*c, id.as_str()))
    }

    /// Encode and broadcast `msg` to every member except `origin`.
    /// Returns the number of receivers.
    pub fn broadcast(&self, msg: &SyncMessage, origin: Option<ConnectionId>) -> Result<usize, ProtocolError> {
        Ok(self.broadcast_raw(msg.encode()?, origin))
    }

    /// Broadcast pre-encoded bytes.
    pub fn broadcast_raw(&self, bytes: Vec<u8>, origin: Option<ConnectionId>) -> usize {
        let count = self.sender.send(Arc::new(Frame { origin, bytes })).unwrap_or(0);
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn lag_reporter(&self) -> LagReporter {
        LagReporter(self.stats.clone())
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            members: self.members.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
