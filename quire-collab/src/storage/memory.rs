//! In-memory `SnapshotStore` with failure injection, for tests and
//! persistence-less deployments.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::{SnapshotStore, StoreError, StoredDocument};
use crate::protocol::DocumentId;

#[derive(Debug, Default)]
struct Entry {
    snapshot: Option<Vec<u8>>,
    updates: Vec<Vec<u8>>,
    next_seq: u64,
    tombstoned: bool,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<DocumentId, Entry>>,
    failing_writes: AtomicU32,
    snapshot_writes: AtomicU64,
    update_writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail with `StoreError::Unavailable`.
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Successful `put_snapshot` calls so far.
    pub fn snapshot_writes(&self) -> u64 {
        self.snapshot_writes.load(Ordering::SeqCst)
    }

    /// Successful `append_update` calls so far.
    pub fn update_writes(&self) -> u64 {
        self.update_writes.load(Ordering::SeqCst)
    }

    /// Number of updates in the log since the last snapshot.
    pub fn pending_updates(&self, doc: DocumentId) -> usize {
        self.docs.lock().get(&doc).map_or(0, |e| e.updates.len())
    }

    fn check_write(&self) -> Result<(), StoreError> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self, doc: DocumentId) -> Result<Option<StoredDocument>, StoreError> {
        let docs = self.docs.lock();
        match docs.get(&doc) {
            None => Ok(None),
            Some(e) if e.tombstoned => Err(StoreError::Tombstoned(doc)),
            Some(e) => Ok(Some(StoredDocument {
                snapshot: e.snapshot.clone(),
                updates: e.updates.clone(),
            })),
        }
    }

    fn put_snapshot(&self, doc: DocumentId, snapshot: &[u8]) -> Result<(), StoreError> {
        self.check_write()?;
        let mut docs = self.docs.lock();
        let entry = docs.entry(doc).or_default();
        if entry.tombstoned {
            return Err(StoreError::Tombstoned(doc));
        }
        entry.snapshot = Some(snapshot.to_vec());
        entry.updates.clear();
        self.snapshot_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn append_update(&self, doc: DocumentId, update: &[u8]) -> Result<u64, StoreError> {
        self.check_write()?;
        let mut docs = self.docs.lock();
        let entry = docs.entry(doc).or_default();
        if entry.tombstoned {
            return Err(StoreError::Tombstoned(doc));
        }
        entry.updates.push(update.to_vec());
        entry.next_seq += 1;
        self.update_writes.fetch_add(1, Ordering::SeqCst);
        Ok(entry.next_seq)
    }

    fn tombstone(&self, doc: DocumentId) -> Result<(), StoreError> {
        self.check_write()?;
        let mut docs = self.docs.lock();
        let entry = docs.entry(doc).or_default();
        entry.tombstoned = true;
        entry.snapshot = None;
        entry.updates.clear();
        Ok(())
    }

    fn is_tombstoned(&self, doc: DocumentId) -> Result<bool, StoreError> {
        Ok(self.docs.lock().get(&doc).is_some_and(|e| e.tombstoned))
    }

    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let mut ids: Vec<DocumentId> = self
            .docs
            .lock()
            .iter()
            .filter(|(_, e)| !e.tombstoned)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_snapshot_truncates_log() {
        let store = MemoryStore::new();
        let doc = Uuid::new_v4();
        assert_eq!(store.load(doc).unwrap(), None);

        store.append_update(doc, b"u1").unwrap();
        store.append_update(doc, b"u2").unwrap();
        assert_eq!(store.pending_updates(doc), 2);

        store.put_snapshot(doc, b"snap").unwrap();
        store.append_update(doc, b"u3").unwrap();
        let loaded = store.load(doc).unwrap().unwrap();
        assert_eq!(loaded.snapshot.as_deref(), Some(&b"snap"[..]));
        assert_eq!(loaded.updates, vec![b"u3".to_vec()]);
    }

    #[test]
    fn test_injected_failures_run_out() {
        let store = MemoryStore::new();
        let doc = Uuid::new_v4();
        store.fail_next_writes(2);
        assert!(store.put_snapshot(doc, b"a").is_err());
        assert!(store.append_update(doc, b"b").is_err());
        assert!(store.put_snapshot(doc, b"c").is_ok());
        assert_eq!(store.snapshot_writes(), 1);
        assert_eq!(store.update_writes(), 0);
    }

    #[test]
    fn test_tombstone_hides_document() {
        let store = MemoryStore::new();
        let doc = Uuid::new_v4();
        store.put_snapshot(doc, b"x").unwrap();
        store.tombstone(doc).unwrap();

        assert_eq!(store.load(doc), Err(StoreError::Tombstoned(doc)));
        assert!(store.is_tombstoned(doc).unwrap());
        assert!(store.list_documents().unwrap().is_empty());
        assert!(store.append_update(doc, b"late").is_err());
    }
}
