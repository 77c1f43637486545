use std::sync::atomic::{AtomicU64, Ordering};

/// Coordinator statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: u64,
    pub relayed_updates: u64,
    pub dropped_batches: u64,
    pub persisted_updates: u64,
    pub persisted_snapshots: u64,
    pub persistence_failures: u64,
    pub committed_mutations: u64,
}

/// Lock-free counters shared by sessions, rooms and writers.
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub total_connections: AtomicU64,
    pub active_connections: AtomicU64,
    pub rejected_connections: AtomicU64,
    pub total_messages: AtomicU64,
    pub total_bytes: AtomicU64,
    pub active_rooms: AtomicU64,
    pub relayed_updates: AtomicU64,
    pub dropped_batches: AtomicU64,
    pub persisted_updates: AtomicU64,
    pub persisted_snapshots: AtomicU64,
    pub persistence_failures: AtomicU64,
}

impl StatsCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr(counter: &AtomicU64) {
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn received(&self, bytes: usize) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CoordinatorStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CoordinatorStats {
            total_connections: load(&self.total_connections),
            active_connections: load(&self.active_connections),
            rejected_connections: load(&self.rejected_connections),
            total_messages: load(&self.total_messages),
            total_bytes: load(&self.total_bytes),
            active_rooms: load(&self.active_rooms),
            relayed_updates: load(&self.relayed_updates),
            dropped_batches: load(&self.dropped_batches),
            persisted_updates: load(&self.persisted_updates),
            persisted_snapshots: load(&self.persisted_snapshots),
            persistence_failures: load(&self.persistence_failures),
            committed_mutations: 0,
        }
    }
}
