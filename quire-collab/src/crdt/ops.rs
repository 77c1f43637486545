//! Operation batches: the unit exchanged between replicas.
//!
//! Wire format:
//! ```text
//! ┌─────────┬──────────────────────────────────────────────┐
//! │ version │ bincode(OperationBatch)                      │
//! │ 1 byte  │ origin · clock · ops[] · deletes[]           │
//! └─────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Inserts carry whole runs of text: the i-th character of a run has id
//! `id.offset(i)`, Lamport timestamp `lamport + i` and the previous character
//! as its origin. Deletions are not counted operations; they travel as a
//! grow-only set of character ids, so re-sending them is always harmless.

use serde::{Deserialize, Serialize};

use super::error::CrdtError;
use super::ids::{OpId, ReplicaId};

/// Current batch encoding version.
pub const BATCH_FORMAT_VERSION: u8 = 1;

/// Upper bound on a decoded batch, guards against hostile length prefixes.
const MAX_BATCH_BYTES: usize = 64 * 1024 * 1024;

/// Largest counter or Lamport timestamp a remote op may carry. Leaves room
/// for local edits to keep ticking past anything a peer sent.
pub const MAX_CLOCK: u64 = 1 << 48;

/// Value of an inline mark or document attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Text(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Text(v)
    }
}

/// A counted CRDT operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Insert a run of characters after `origin` (`None` = document start).
    Insert {
        id: OpId,
        lamport: u64,
        origin: Option<OpId>,
        text: String,
    },
    /// Set (or clear, with `None`) an inline mark over the characters between
    /// `start` and `end` inclusive.
    Format {
        id: OpId,
        lamport: u64,
        start: OpId,
        end: OpId,
        key: String,
        value: Option<AttrValue>,
    },
    /// Set (or clear) a document-level attribute.
    SetAttribute {
        id: OpId,
        lamport: u64,
        key: String,
        value: Option<AttrValue>,
    },
}

impl Op {
    pub fn id(&self) -> OpId {
        match self {
            Op::Insert { id, .. } | Op::Format { id, .. } | Op::SetAttribute { id, .. } => *id,
        }
    }

    pub fn lamport(&self) -> u64 {
        match self {
            Op::Insert { lamport, .. }
            | Op::Format { lamport, .. }
            | Op::SetAttribute { lamport, .. } => *lamport,
        }
    }

    /// Number of counters this operation consumes.
    pub fn span(&self) -> u64 {
        match self {
            Op::Insert { text, .. } => text.chars().count() as u64,
            _ => 1,
        }
    }

    /// Counter of the last item created by this operation.
    pub fn last_counter(&self) -> u64 {
        self.id().counter + self.span().saturating_sub(1)
    }

    /// Lamport timestamp of the last item created by this operation.
    pub fn last_lamport(&self) -> u64 {
        self.lamport() + self.span().saturating_sub(1)
    }

    /// Drop the first `n` characters of an insert run. The remainder's origin
    /// becomes the last dropped character.
    pub(crate) fn skip_chars(&self, n: u64) -> Op {
        match self {
            Op::Insert { id, lamport, origin, text } if n > 0 => Op::Insert {
                id: id.offset(n),
                lamport: lamport + n,
                origin: Some(id.offset(n - 1)),
                text: text.chars().skip(n as usize).collect(),
            },
            other => other.clone(),
        }
    }

    fn validate(&self) -> Result<(), CrdtError> {
        let id = self.id();
        if id.counter == 0 {
            return Err(CrdtError::InvalidBatch(format!("zero counter on op from replica {}", id.replica)));
        }
        if self.lamport() == 0 {
            return Err(CrdtError::InvalidBatch(format!("zero lamport timestamp on {id}")));
        }
        let in_range = |start: u64| start.checked_add(self.span()).is_some_and(|end| end <= MAX_CLOCK);
        if !in_range(id.counter) || !in_range(self.lamport()) {
            return Err(CrdtError::InvalidBatch(format!("clock out of range on {id}")));
        }
        match self {
            Op::Insert { text, origin, .. } => {
                if text.is_empty() {
                    return Err(CrdtError::InvalidBatch(format!("empty insert run {id}")));
                }
                if let Some(origin) = origin {
                    if origin.replica == id.replica && origin.counter >= id.counter {
                        return Err(CrdtError::InvalidBatch(format!("insert {id} anchored on a later item")));
                    }
                }
            }
            Op::Format { key, start, end, .. } => {
                if key.is_empty() {
                    return Err(CrdtError::InvalidBatch(format!("empty mark key on {id}")));
                }
                if start.counter == 0 || end.counter == 0 {
                    return Err(CrdtError::InvalidBatch(format!("mark {id} anchored on zero counter")));
                }
            }
            Op::SetAttribute { key, .. } => {
                if key.is_empty() {
                    return Err(CrdtError::InvalidBatch(format!("empty attribute key on {id}")));
                }
            }
        }
        Ok(())
    }
}

/// A self-describing set of operations plus deletions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationBatch {
    /// Replica that produced this batch.
    pub origin: ReplicaId,
    /// Producer's Lamport clock when the batch was produced.
    pub clock: u64,
    /// Counted operations.
    pub ops: Vec<Op>,
    /// Deleted character ids.
    pub deletes: Vec<OpId>,
}

impl OperationBatch {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.deletes.is_empty()
    }

    /// Check structural invariants without touching any replica.
    pub fn validate(&self) -> Result<(), CrdtError> {
        for op in &self.ops {
            op.validate()?;
        }
        if let Some(bad) = self.deletes.iter().find(|id| id.counter == 0) {
            return Err(CrdtError::InvalidBatch(format!("delete of zero counter on replica {}", bad.replica)));
        }
        Ok(())
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, CrdtError> {
        let body = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CrdtError::Serialization(e.to_string()))?;
        let mut out = Vec::with_capacity(body.len() + 1);
        out.push(BATCH_FORMAT_VERSION);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Deserialize and validate. Nothing is applied on failure.
    pub fn decode(bytes: &[u8]) -> Result<Self, CrdtError> {
        let (version, body) = bytes
            .split_first()
            .ok_or_else(|| CrdtError::MalformedBatch("empty payload".into()))?;
        if *version != BATCH_FORMAT_VERSION {
            return Err(CrdtError::UnsupportedVersion(*version));
        }
        let (batch, read): (Self, usize) = bincode::serde::decode_from_slice(
            body,
            bincode::config::standard().with_limit::<MAX_BATCH_BYTES>(),
        )
        .map_err(|e| CrdtError::MalformedBatch(e.to_string()))?;
        if read != body.len() {
            return Err(CrdtError::MalformedBatch(format!(
                "{} trailing bytes after batch",
                body.len() - read
            )));
        }
        batch.validate()?;
        Ok(batch)
    }
}
