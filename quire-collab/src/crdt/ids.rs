//! Replica and operation identifiers, plus the state vector used by the
//! sync handshake.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::error::CrdtError;

/// Identity of one replica (one open editor session or the coordinator).
pub type ReplicaId = u64;

/// Globally unique id of a single CRDT item: the replica that created it and
/// that replica's per-item counter (starting at 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId {
    pub replica: ReplicaId,
    pub counter: u64,
}

impl OpId {
    pub fn new(replica: ReplicaId, counter: u64) -> Self {
        Self { replica, counter }
    }

    /// The id `n` counters after this one on the same replica.
    pub fn offset(self, n: u64) -> Self {
        Self {
            replica: self.replica,
            counter: self.counter + n,
        }
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.counter, self.replica)
    }
}

/// Total order used to place concurrent insertions after the same origin.
///
/// Higher Lamport timestamps sort first; equal timestamps fall back to the
/// higher replica id.
pub(crate) fn priority(lamport: u64, id: OpId) -> (u64, ReplicaId) {
    (lamport, id.replica)
}

/// Summary of which operations a replica has integrated: for each replica,
/// the highest contiguous counter seen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector(BTreeMap<ReplicaId, u64>);

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest contiguous counter integrated from `replica` (0 if none).
    pub fn get(&self, replica: ReplicaId) -> u64 {
        self.0.get(&replica).copied().unwrap_or(0)
    }

    /// Whether the operation with this id has already been integrated.
    pub fn contains(&self, id: OpId) -> bool {
        id.counter <= self.get(id.replica)
    }

    pub(crate) fn advance(&mut self, replica: ReplicaId, counter: u64) {
        let entry = self.0.entry(replica).or_insert(0);
        if counter > *entry {
            *entry = counter;
        }
    }

    /// True if every counter in `other` is covered by `self`.
    pub fn dominates(&self, other: &StateVector) -> bool {
        other.0.iter().all(|(replica, counter)| self.get(*replica) >= *counter)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, u64)> + '_ {
        self.0.iter().map(|(r, c)| (*r, *c))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>, CrdtError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CrdtError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CrdtError> {
        let (sv, _) = bincode::serde::decode_from_slice(
            bytes,
            bincode::config::standard().with_limit::<{ 1024 * 1024 }>(),
        )
        .map_err(|e| CrdtError::MalformedBatch(e.to_string()))?;
        Ok(sv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_vector_contains() {
        let mut sv = StateVector::new();
        assert!(!sv.contains(OpId::new(1, 1)));

        sv.advance(1, 3);
        assert!(sv.contains(OpId::new(1, 3)));
        assert!(!sv.contains(OpId::new(1, 4)));
        assert!(!sv.contains(OpId::new(2, 1)));
    }

    #[test]
    fn test_state_vector_never_moves_backwards() {
        let mut sv = StateVector::new();
        sv.advance(7, 10);
        sv.advance(7, 4);
        assert_eq!(sv.get(7), 10);
    }

    #[test]
    fn test_dominates() {
        let mut a = StateVector::new();
        let mut b = StateVector::new();
        a.advance(1, 5);
        a.advance(2, 2);
        b.advance(1, 3);
        assert!(a.dominates(&b));
        assert!(!b.dominates(&a));

        b.advance(3, 1);
        assert!(!a.dominates(&b));
    }

    #[test]
    fn test_priority_breaks_ties_by_replica() {
        let low = priority(4, OpId::new(1, 9));
        let high = priority(4, OpId::new(2, 1));
        assert!(high > low);
        assert!(priority(5, OpId::new(1, 1)) > high);
    }

    #[test]
    fn test_decode_garbage_state_vector() {
        assert!(StateVector::decode(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF]).is_err());
    }
}
