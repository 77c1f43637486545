//! Replicated rich-text document.
//!
//! Characters form an RGA sequence: each one remembers the character it was
//! typed after (its origin). To integrate a character we start right after its
//! origin and skip every element with a higher `(lamport, replica)` priority;
//! those are concurrent insertions that won the tie-break, or their
//! descendants. Deleted characters stay in the sequence as tombstones so later
//! operations can still anchor on them.
//!
//! Inline marks are ranges between two character ids, resolved per key by
//! last-writer-wins. Document attributes are a last-writer-wins map. Every
//! counted operation is retained, which is what lets `diff_since` rebuild the
//! exact operations a peer is missing from compacted state.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use super::error::CrdtError;
use super::ids::{priority, OpId, ReplicaId, StateVector};
use super::ops::{AttrValue, Op, OperationBatch};
use super::{Edit, MergeOutcome, Replica};

/// Current snapshot encoding version.
pub const SNAPSHOT_FORMAT_VERSION: u8 = 1;

const MAX_SNAPSHOT_BYTES: usize = 512 * 1024 * 1024;

#[derive(Debug, Clone)]
struct Element {
    id: OpId,
    lamport: u64,
    origin: Option<OpId>,
    ch: char,
    deleted: bool,
}

impl Element {
    fn priority(&self) -> (u64, ReplicaId) {
        priority(self.lamport, self.id)
    }
}

#[derive(Debug, Clone)]
struct Mark {
    lamport: u64,
    start: OpId,
    end: OpId,
    key: String,
    value: Option<AttrValue>,
}

#[derive(Debug, Clone)]
struct AttributeWrite {
    lamport: u64,
    key: String,
    value: Option<AttrValue>,
}

/// Compacted, replica-independent encoding of the full document history.
#[derive(Serialize, Deserialize)]
struct SnapshotBody {
    ops: Vec<Op>,
    deletes: Vec<OpId>,
}

/// A run of visible text sharing the same inline marks.
#[derive(Debug, Clone, PartialEq)]
pub struct TextSpan {
    pub text: String,
    pub marks: BTreeMap<String, AttrValue>,
}

/// A paragraph-level block: spans up to (not including) a `\n` separator.
/// Block attributes are the marks on the separator itself.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    pub spans: Vec<TextSpan>,
    pub attributes: BTreeMap<String, AttrValue>,
}

impl Block {
    pub fn text(&self) -> String {
        self.spans.iter().map(|s| s.text.as_str()).collect()
    }
}

enum Readiness {
    /// Every item of the op is already integrated.
    Seen,
    /// Integrable now (after dropping any already-seen prefix).
    Ready(Op),
    /// Waiting on an earlier counter or a missing anchor.
    Blocked,
}

/// Replicated rich-text document.
#[derive(Debug, Clone)]
pub struct RichTextDocument {
    replica: ReplicaId,
    lamport: u64,
    elements: Vec<Element>,
    known: HashSet<OpId>,
    deletes: BTreeSet<OpId>,
    marks: BTreeMap<OpId, Mark>,
    attributes: BTreeMap<OpId, AttributeWrite>,
    state: StateVector,
    pending: BTreeMap<OpId, Op>,
}

impl RichTextDocument {
    /// Create an empty replica with the given identity.
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            lamport: 0,
            elements: Vec::new(),
            known: HashSet::new(),
            deletes: BTreeSet::new(),
            marks: BTreeMap::new(),
            attributes: BTreeMap::new(),
            state: StateVector::new(),
            pending: BTreeMap::new(),
        }
    }

    /// Create a replica and load a snapshot into it.
    pub fn from_snapshot(replica: ReplicaId, bytes: &[u8]) -> Result<Self, CrdtError> {
        let mut doc = Self::new(replica);
        doc.load_snapshot(bytes)?;
        Ok(doc)
    }

    /// Visible text.
    pub fn text(&self) -> String {
        self.visible().map(|e| e.ch).collect()
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.visible().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of deleted characters still held as tombstones.
    pub fn tombstone_count(&self) -> usize {
        self.elements.iter().filter(|e| e.deleted).count()
    }

    /// Number of operations waiting on missing dependencies.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Current Lamport clock.
    pub fn clock(&self) -> u64 {
        self.lamport
    }

    /// Current value of a document attribute.
    pub fn attribute(&self, key: &str) -> Option<&AttrValue> {
        self.attributes
            .iter()
            .filter(|(_, w)| w.key == key)
            .max_by_key(|(id, w)| priority(w.lamport, **id))
            .and_then(|(_, w)| w.value.as_ref())
    }

    /// All document attributes that currently hold a value.
    pub fn attributes(&self) -> BTreeMap<String, AttrValue> {
        let mut winners: BTreeMap<&str, (u64, ReplicaId, Option<&AttrValue>)> = BTreeMap::new();
        for (id, write) in &self.attributes {
            let (lamport, replica) = priority(write.lamport, *id);
            let slot = winners.entry(write.key.as_str()).or_insert((0, 0, None));
            if (lamport, replica) >= (slot.0, slot.1) {
                *slot = (lamport, replica, write.value.as_ref());
            }
        }
        winners
            .into_iter()
            .filter_map(|(key, (_, _, value))| value.map(|v| (key.to_string(), v.clone())))
            .collect()
    }

    /// Inline marks in effect on each visible character.
    fn resolved_marks(&self) -> Vec<BTreeMap<String, AttrValue>> {
        let positions: HashMap<OpId, usize> = self
            .elements
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id, i))
            .collect();

        // Per element slot: key -> (priority, value)
        let mut per_slot: Vec<BTreeMap<&str, ((u64, ReplicaId), Option<&AttrValue>)>> =
            vec![BTreeMap::new(); self.elements.len()];
        for (id, mark) in &self.marks {
            let (Some(&a), Some(&b)) = (positions.get(&mark.start), positions.get(&mark.end)) else {
                continue;
            };
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let prio = priority(mark.lamport, *id);
            for slot in &mut per_slot[lo..=hi] {
                let entry = slot.entry(mark.key.as_str()).or_insert(((0, 0), None));
                if prio >= entry.0 {
                    *entry = (prio, mark.value.as_ref());
                }
            }
        }

        self.elements
            .iter()
            .zip(per_slot)
            .filter(|(e, _)| !e.deleted)
            .map(|(_, slot)| {
                slot.into_iter()
                    .filter_map(|(k, (_, v))| v.map(|v| (k.to_string(), v.clone())))
                    .collect()
            })
            .collect()
    }

    /// Visible content as runs of identically-marked text.
    pub fn spans(&self) -> Vec<TextSpan> {
        let marks = self.resolved_marks();
        let mut spans: Vec<TextSpan> = Vec::new();
        for (e, m) in self.visible().zip(marks) {
            match spans.last_mut() {
                Some(last) if last.marks == m => last.text.push(e.ch),
                _ => spans.push(TextSpan {
                    text: e.ch.to_string(),
                    marks: m,
                }),
            }
        }
        spans
    }

    /// Visible content split into blocks at `\n` separators.
    pub fn blocks(&self) -> Vec<Block> {
        let marks = self.resolved_marks();
        let mut blocks = Vec::new();
        let mut current = Block::default();
        for (e, m) in self.visible().zip(marks) {
            if e.ch == '\n' {
                current.attributes = m;
                blocks.push(std::mem::take(&mut current));
                continue;
            }
            match current.spans.last_mut() {
                Some(last) if last.marks == m => last.text.push(e.ch),
                _ => current.spans.push(TextSpan {
                    text: e.ch.to_string(),
                    marks: m,
                }),
            }
        }
        blocks.push(current);
        blocks
    }

    fn visible(&self) -> impl Iterator<Item = &Element> {
        self.elements.iter().filter(|e| !e.deleted)
    }

    fn visible_id(&self, index: usize) -> Option<OpId> {
        self.visible().nth(index).map(|e| e.id)
    }

    fn check_range(&self, index: usize, len: usize) -> Result<(), CrdtError> {
        let total = self.len();
        if len == 0 {
            return Err(CrdtError::EmptyEdit);
        }
        if index.checked_add(len).is_none_or(|end| end > total) {
            return Err(CrdtError::PositionOutOfBounds { pos: index.saturating_add(len), len: total });
        }
        Ok(())
    }

    fn next_id(&self) -> OpId {
        OpId::new(self.replica, self.state.get(self.replica) + 1)
    }

    fn local_batch(&self, ops: Vec<Op>, deletes: Vec<OpId>) -> OperationBatch {
        OperationBatch {
            origin: self.replica,
            clock: self.lamport,
            ops,
            deletes,
        }
    }

    fn classify(&self, op: &Op) -> Readiness {
        let id = op.id();
        let seen = self.state.get(id.replica);
        if op.last_counter() <= seen {
            return Readiness::Seen;
        }
        if id.counter > seen + 1 {
            return Readiness::Blocked;
        }
        let op = op.skip_chars(seen + 1 - id.counter);
        let anchored = match &op {
            Op::Insert { origin, .. } => origin.is_none_or(|o| self.known.contains(&o)),
            Op::Format { start, end, .. } => self.known.contains(start) && self.known.contains(end),
            Op::SetAttribute { .. } => true,
        };
        if anchored {
            Readiness::Ready(op)
        } else {
            Readiness::Blocked
        }
    }

    /// Integrate one operation, or park it until its dependencies arrive.
    /// Returns `(applied, duplicate)`.
    fn integrate(&mut self, op: &Op) -> (bool, bool) {
        match self.classify(op) {
            Readiness::Seen => (false, true),
            Readiness::Blocked => {
                let id = op.id();
                let keep_existing = self
                    .pending
                    .get(&id)
                    .is_some_and(|existing| existing.span() >= op.span());
                if !keep_existing {
                    self.pending.insert(id, op.clone());
                }
                (false, false)
            }
            Readiness::Ready(op) => {
                self.apply_ready(op);
                self.drain_pending();
                (true, false)
            }
        }
    }

    fn drain_pending(&mut self) {
        loop {
            let mut progressed = false;
            let ids: Vec<OpId> = self.pending.keys().copied().collect();
            for id in ids {
                let Some(op) = self.pending.get(&id) else { continue };
                match self.classify(op) {
                    Readiness::Seen => {
                        self.pending.remove(&id);
                    }
                    Readiness::Ready(ready) => {
                        self.pending.remove(&id);
                        self.apply_ready(ready);
                        progressed = true;
                    }
                    Readiness::Blocked => {}
                }
            }
            if !progressed {
                break;
            }
        }
    }

    fn apply_ready(&mut self, op: Op) {
        let id = op.id();
        self.lamport = self.lamport.max(op.last_lamport());
        self.state.advance(id.replica, op.last_counter());
        match op {
            Op::Insert { id, lamport, origin, text } => {
                let mut start = match origin {
                    Some(o) => self.position_of(o).map_or(0, |p| p + 1),
                    None => 0,
                };
                let mut prev = origin;
                for (i, ch) in text.chars().enumerate() {
                    let element = Element {
                        id: id.offset(i as u64),
                        lamport: lamport + i as u64,
                        origin: prev,
                        ch,
                        deleted: false,
                    };
                    let pos = self.place_after(start, element.priority());
                    let element = Element {
                        deleted: self.deletes.contains(&element.id),
                        ..element
                    };
                    prev = Some(element.id);
                    self.known.insert(element.id);
                    self.elements.insert(pos, element);
                    start = pos + 1;
                }
            }
            Op::Format { lamport, start, end, key, value, .. } => {
                self.marks.insert(id, Mark { lamport, start, end, key, value });
            }
            Op::SetAttribute { lamport, key, value, .. } => {
                self.attributes.insert(id, AttributeWrite { lamport, key, value });
            }
        }
    }

    /// Index at which an element with `prio` lands when its origin sits just
    /// before `start`.
    fn place_after(&self, start: usize, prio: (u64, ReplicaId)) -> usize {
        let mut pos = start;
        while pos < self.elements.len() && self.elements[pos].priority() > prio {
            pos += 1;
        }
        pos
    }

    fn position_of(&self, id: OpId) -> Option<usize> {
        self.elements.iter().position(|e| e.id == id)
    }

    fn apply_delete(&mut self, id: OpId) -> bool {
        if !self.deletes.insert(id) {
            return false;
        }
        if self.known.contains(&id) {
            if let Some(pos) = self.position_of(id) {
                self.elements[pos].deleted = true;
            }
        }
        true
    }

    /// Every counted op with a counter beyond `remote`, in `(replica, counter)`
    /// order, with consecutive characters folded back into runs.
    fn ops_since(&self, remote: &StateVector) -> Vec<Op> {
        let mut ops: BTreeMap<OpId, Op> = BTreeMap::new();
        for e in &self.elements {
            if !remote.contains(e.id) {
                ops.insert(
                    e.id,
                    Op::Insert {
                        id: e.id,
                        lamport: e.lamport,
                        origin: e.origin,
                        text: e.ch.to_string(),
                    },
                );
            }
        }
        for (id, m) in &self.marks {
            if !remote.contains(*id) {
                ops.insert(
                    *id,
                    Op::Format {
                        id: *id,
                        lamport: m.lamport,
                        start: m.start,
                        end: m.end,
                        key: m.key.clone(),
                        value: m.value.clone(),
                    },
                );
            }
        }
        for (id, w) in &self.attributes {
            if !remote.contains(*id) {
                ops.insert(
                    *id,
                    Op::SetAttribute {
                        id: *id,
                        lamport: w.lamport,
                        key: w.key.clone(),
                        value: w.value.clone(),
                    },
                );
            }
        }
        for (id, op) in &self.pending {
            if op.last_counter() > remote.get(id.replica) {
                ops.entry(*id).or_insert_with(|| op.clone());
            }
        }

        let mut folded: Vec<Op> = Vec::with_capacity(ops.len());
        for op in ops.into_values() {
            if let (
                Some(Op::Insert { id: run_id, lamport: run_lamport, text: run_text, .. }),
                Op::Insert { id, lamport, origin, text },
            ) = (folded.last_mut(), &op)
            {
                let run_len = run_text.chars().count() as u64;
                let last = run_id.offset(run_len - 1);
                if *id == last.offset(1) && *lamport == *run_lamport + run_len && *origin == Some(last) {
                    run_text.push_str(text);
                    continue;
                }
            }
            folded.push(op);
        }
        folded
    }
}

impl Replica for RichTextDocument {
    fn replica_id(&self) -> ReplicaId {
        self.replica
    }

    fn apply_local_edit(&mut self, edit: Edit) -> Result<OperationBatch, CrdtError> {
        match edit {
            Edit::Insert { index, text } => {
                if text.is_empty() {
                    return Err(CrdtError::EmptyEdit);
                }
                let len = self.len();
                if index > len {
                    return Err(CrdtError::PositionOutOfBounds { pos: index, len });
                }
                let origin = if index == 0 { None } else { self.visible_id(index - 1) };
                let op = Op::Insert {
                    id: self.next_id(),
                    lamport: self.lamport + 1,
                    origin,
                    text,
                };
                self.integrate(&op);
                Ok(self.local_batch(vec![op], Vec::new()))
            }
            Edit::Delete { index, len } => {
                self.check_range(index, len)?;
                let ids: Vec<OpId> = self.visible().skip(index).take(len).map(|e| e.id).collect();
                for id in &ids {
                    self.apply_delete(*id);
                }
                Ok(self.local_batch(Vec::new(), ids))
            }
            Edit::Format { index, len, key, value } => {
                self.check_range(index, len)?;
                let (Some(start), Some(end)) = (self.visible_id(index), self.visible_id(index + len - 1)) else {
                    return Err(CrdtError::PositionOutOfBounds { pos: index + len, len: self.len() });
                };
                let op = Op::Format {
                    id: self.next_id(),
                    lamport: self.lamport + 1,
                    start,
                    end,
                    key,
                    value,
                };
                self.integrate(&op);
                Ok(self.local_batch(vec![op], Vec::new()))
            }
            Edit::SetAttribute { key, value } => {
                if key.is_empty() {
                    return Err(CrdtError::EmptyEdit);
                }
                let op = Op::SetAttribute {
                    id: self.next_id(),
                    lamport: self.lamport + 1,
                    key,
                    value,
                };
                self.integrate(&op);
                Ok(self.local_batch(vec![op], Vec::new()))
            }
        }
    }

    fn apply_remote_batch(&mut self, batch: &OperationBatch) -> Result<MergeOutcome, CrdtError> {
        batch.validate()?;
        let mut outcome = MergeOutcome::default();
        for op in &batch.ops {
            let (applied, duplicate) = self.integrate(op);
            if applied {
                outcome.applied += 1;
            } else if duplicate {
                outcome.duplicates += 1;
            }
        }
        for id in &batch.deletes {
            if self.apply_delete(*id) {
                outcome.deleted += 1;
            }
        }
        outcome.buffered = self.pending.len();
        Ok(outcome)
    }

    fn snapshot(&self) -> Result<Vec<u8>, CrdtError> {
        let body = SnapshotBody {
            ops: self.ops_since(&StateVector::new()),
            deletes: self.deletes.iter().copied().collect(),
        };
        let encoded = bincode::serde::encode_to_vec(&body, bincode::config::standard())
            .map_err(|e| CrdtError::Serialization(e.to_string()))?;
        let mut out = Vec::with_capacity(encoded.len() + 1);
        out.push(SNAPSHOT_FORMAT_VERSION);
        out.extend_from_slice(&encoded);
        Ok(out)
    }

    fn load_snapshot(&mut self, bytes: &[u8]) -> Result<(), CrdtError> {
        let (version, body) = bytes
            .split_first()
            .ok_or_else(|| CrdtError::MalformedBatch("empty snapshot".into()))?;
        if *version != SNAPSHOT_FORMAT_VERSION {
            return Err(CrdtError::UnsupportedVersion(*version));
        }
        let (body, _): (SnapshotBody, usize) = bincode::serde::decode_from_slice(
            body,
            bincode::config::standard().with_limit::<MAX_SNAPSHOT_BYTES>(),
        )
        .map_err(|e| CrdtError::MalformedBatch(e.to_string()))?;
        let batch = OperationBatch {
            origin: self.replica,
            clock: 0,
            ops: body.ops,
            deletes: body.deletes,
        };
        batch.validate()?;

        *self = Self::new(self.replica);
        self.apply_remote_batch(&batch)?;
        Ok(())
    }

    fn state_vector(&self) -> StateVector {
        self.state.clone()
    }

    fn diff_since(&self, remote: &StateVector) -> OperationBatch {
        OperationBatch {
            origin: self.replica,
            clock: self.lamport,
            ops: self.ops_since(remote),
            deletes: self.deletes.iter().copied().collect(),
        }
    }
}
