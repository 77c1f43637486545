//! Pending-mutation arena keyed by sequence number.

use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::{MutationId, MutationRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStatus {
    /// Waiting to be (re)sent.
    Queued,
    /// Sent; no final response yet.
    InFlight,
}

/// One mutation applied locally but not yet confirmed or rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub sequence: u64,
    pub client_mutation_id: MutationId,
    pub mutation_name: String,
    pub args: Value,
    pub issued_at_ms: u64,
    pub status: PendingStatus,
}

#[derive(Debug, Clone)]
pub struct PendingQueue {
    entries: BTreeMap<u64, PendingEntry>,
    next_sequence: u64,
    epoch: Uuid,
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingQueue {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_sequence: 1,
            epoch: Uuid::new_v4(),
        }
    }

    /// Identifies this queue's sequence numbering to the authority.
    pub fn epoch(&self) -> Uuid {
        self.epoch
    }

    /// Append a mutation, assigning the next sequence number and a fresh id.
    pub fn push(&mut self, mutation_name: impl Into<String>, args: Value, issued_at_ms: u64) -> &PendingEntry {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.entry(sequence).or_insert(PendingEntry {
            sequence,
            client_mutation_id: Uuid::new_v4(),
            mutation_name: mutation_name.into(),
            args,
            issued_at_ms,
            status: PendingStatus::Queued,
        })
    }

    pub fn get(&self, sequence: u64) -> Option<&PendingEntry> {
        self.entries.get(&sequence)
    }

    /// Sequence number of the entry with this mutation id.
    pub fn find(&self, id: MutationId) -> Option<u64> {
        self.entries.values().find(|e| e.client_mutation_id == id).map(|e| e.sequence)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in issue order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingEntry> {
        self.entries.values()
    }

    /// Sequence numbers that still need a final response, in the order they
    /// must be sent. After a reconnect this is the full resend order.
    pub fn replay_plan(&self) -> Vec<u64> {
        self.entries.keys().copied().collect()
    }

    /// The next entry to submit, or `None` while one is in flight.
    pub fn next_to_send(&self) -> Option<&PendingEntry> {
        if self.entries.values().any(|e| e.status == PendingStatus::InFlight) {
            return None;
        }
        self.replay_plan().first().and_then(|seq| self.entries.get(seq))
    }

    pub fn mark_in_flight(&mut self, sequence: u64) {
        if let Some(entry) = self.entries.get_mut(&sequence) {
            entry.status = PendingStatus::InFlight;
        }
    }

    /// Return every in-flight entry to the queue, e.g. after a disconnect.
    pub fn requeue_all(&mut self) -> usize {
        let mut requeued = 0;
        for entry in self.entries.values_mut() {
            if entry.status == PendingStatus::InFlight {
                entry.status = PendingStatus::Queued;
                requeued += 1;
            }
        }
        requeued
    }

    /// Remove an entry once its final response arrived.
    pub fn resolve(&mut self, sequence: u64) -> Option<PendingEntry> {
        self.entries.remove(&sequence)
    }

    /// Highest sequence number below which every entry is resolved.
    pub fn acknowledged_through(&self) -> u64 {
        match self.entries.keys().next() {
            Some(first) => first - 1,
            None => self.next_sequence - 1,
        }
    }

    pub fn request(&self, sequence: u64, client_id: &str) -> Option<MutationRequest> {
        let entry = self.entries.get(&sequence)?;
        Some(MutationRequest {
            mutation_name: entry.mutation_name.clone(),
            args: entry.args.clone(),
            client_id: client_id.to_string(),
            epoch: self.epoch,
            client_mutation_id: entry.client_mutation_id,
            sequence_number: entry.sequence,
            issued_at_ms: entry.issued_at_ms,
            acknowledged_through: self.acknowledged_through(),
        })
    }
}
