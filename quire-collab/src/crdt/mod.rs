//! Replicated rich-text document model.
//!
//! A [`Replica`] accepts local edits, producing an [`OperationBatch`] to send
//! to peers, and merges remote batches in any order, any number of times.
//! Two replicas that have integrated the same set of operations render the
//! same text, marks and attributes, and produce byte-identical snapshots.

mod document;
mod error;
mod ids;
mod ops;

pub use document::{Block, RichTextDocument, TextSpan, SNAPSHOT_FORMAT_VERSION};
pub use error::CrdtError;
pub use ids::{OpId, ReplicaId, StateVector};
pub use ops::{AttrValue, Op, OperationBatch, BATCH_FORMAT_VERSION};

/// A user-level edit expressed against visible positions.
#[derive(Debug, Clone, PartialEq)]
pub enum Edit {
    /// Insert `text` before the visible character at `index`.
    Insert { index: usize, text: String },
    /// Delete `len` visible characters starting at `index`.
    Delete { index: usize, len: usize },
    /// Set (or clear with `None`) an inline mark on a visible range. A mark
    /// on a `\n` separator is a block attribute.
    Format {
        index: usize,
        len: usize,
        key: String,
        value: Option<AttrValue>,
    },
    /// Set (or clear) a document-level attribute.
    SetAttribute { key: String, value: Option<AttrValue> },
}

/// What merging one remote batch did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Operations integrated right away.
    pub applied: usize,
    /// Operations that were already integrated.
    pub duplicates: usize,
    /// Deletions not seen before.
    pub deleted: usize,
    /// Operations waiting on missing dependencies after this merge.
    pub buffered: usize,
}

impl MergeOutcome {
    /// Whether the visible document may have changed.
    pub fn changed(&self) -> bool {
        self.applied > 0 || self.deleted > 0
    }
}

/// A replica of one collaborative document.
pub trait Replica: Send {
    fn replica_id(&self) -> ReplicaId;

    /// Apply an edit locally and return the batch describing it.
    fn apply_local_edit(&mut self, edit: Edit) -> Result<OperationBatch, CrdtError>;

    /// Merge a batch produced elsewhere. Idempotent and order-independent;
    /// an invalid batch is rejected before any state changes.
    fn apply_remote_batch(&mut self, batch: &OperationBatch) -> Result<MergeOutcome, CrdtError>;

    /// Decode and merge a batch in wire format.
    fn apply_encoded_batch(&mut self, bytes: &[u8]) -> Result<MergeOutcome, CrdtError> {
        let batch = OperationBatch::decode(bytes)?;
        self.apply_remote_batch(&batch)
    }

    /// Serialize the full replicated state.
    fn snapshot(&self) -> Result<Vec<u8>, CrdtError>;

    /// Replace this replica's state with a snapshot. On error the replica is
    /// left as it was.
    fn load_snapshot(&mut self, bytes: &[u8]) -> Result<(), CrdtError>;

    fn state_vector(&self) -> StateVector;

    /// Every operation not covered by `remote`, plus all known deletions.
    fn diff_since(&self, remote: &StateVector) -> OperationBatch;
}

#[cfg(test)]
mod convergence_tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    fn random_edit(doc: &RichTextDocument, rng: &mut StdRng) -> Edit {
        let len = doc.len();
        match rng.gen_range(0..10) {
            0..=5 => {
                let text: String = (0..rng.gen_range(1..4))
                    .map(|_| rng.gen_range(b'a'..=b'z') as char)
                    .collect();
                Edit::Insert { index: rng.gen_range(0..=len), text }
            }
            6..=7 if len > 0 => {
                let index = rng.gen_range(0..len);
                Edit::Delete { index, len: rng.gen_range(1..=(len - index).min(3)) }
            }
            8 if len > 0 => {
                let index = rng.gen_range(0..len);
                Edit::Format {
                    index,
                    len: 1,
                    key: "bold".into(),
                    value: rng.gen_bool(0.5).then_some(AttrValue::Bool(true)),
                }
            }
            _ => Edit::SetAttribute {
                key: "title".into(),
                value: Some(AttrValue::Int(rng.gen_range(0..100))),
            },
        }
    }

    #[test]
    fn test_random_shuffles_converge() {
        for seed in 0..20u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut replicas: Vec<RichTextDocument> = (1..=3).map(RichTextDocument::new).collect();
            let mut log: Vec<OperationBatch> = Vec::new();

            for _ in 0..40 {
                let who = rng.gen_range(0..replicas.len());
                // Occasionally catch up on a random prefix of history first.
                if rng.gen_bool(0.3) && !log.is_empty() {
                    let upto = rng.gen_range(0..log.len());
                    for batch in &log[..=upto] {
                        replicas[who].apply_remote_batch(batch).unwrap();
                    }
                }
                let edit = random_edit(&replicas[who], &mut rng);
                log.push(replicas[who].apply_local_edit(edit).unwrap());
            }

            let mut finals = Vec::new();
            for replica in &mut replicas {
                let mut order = log.clone();
                order.shuffle(&mut rng);
                for batch in order.iter().chain(order.iter().rev()) {
                    replica.apply_remote_batch(batch).unwrap();
                }
                assert_eq!(replica.pending_count(), 0, "seed {seed}");
                finals.push(replica.snapshot().unwrap());
            }

            assert!(finals.windows(2).all(|w| w[0] == w[1]), "seed {seed} diverged");
            let texts: Vec<String> = replicas.iter().map(|r| r.text()).collect();
            assert!(texts.windows(2).all(|w| w[0] == w[1]), "seed {seed}: {texts:?}");
        }
    }

    #[test]
    fn test_diff_exchange_converges() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut a = RichTextDocument::new(10);
        let mut b = RichTextDocument::new(20);

        for _ in 0..30 {
            let edit = random_edit(&a, &mut rng);
            a.apply_local_edit(edit).unwrap();
            let edit = random_edit(&b, &mut rng);
            b.apply_local_edit(edit).unwrap();
        }

        let to_b = a.diff_since(&b.state_vector());
        let to_a = b.diff_since(&a.state_vector());
        b.apply_remote_batch(&to_b).unwrap();
        a.apply_remote_batch(&to_a).unwrap();

        assert_eq!(a.text(), b.text());
        assert_eq!(a.snapshot().unwrap(), b.snapshot().unwrap());
        assert!(a.diff_since(&b.state_vector()).ops.is_empty());
    }

    #[test]
    fn test_encoded_batch_merge() {
        let mut a = RichTextDocument::new(1);
        let mut b = RichTextDocument::new(2);
        let batch = a.apply_local_edit(Edit::Insert { index: 0, text: "wire".into() }).unwrap();

        let outcome = b.apply_encoded_batch(&batch.encode().unwrap()).unwrap();
        assert!(outcome.changed());
        assert_eq!(b.text(), "wire");

        assert!(b.apply_encoded_batch(&[BATCH_FORMAT_VERSION, 1, 2, 3]).is_err());
        assert_eq!(b.text(), "wire");
    }
}
