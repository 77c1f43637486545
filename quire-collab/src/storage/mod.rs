//! Durable storage for document replicas.
//!
//! ```text
//! ┌─────────────┐  append_update   ┌───────────────────────────────────┐
//! │ room writer │ ───────────────► │ SnapshotStore                     │
//! │ (one / doc) │  put_snapshot    │   snapshot:  compacted state      │
//! └──────┬──────┘                  │   updates:   log since snapshot   │
//!        │ load on room start      │   tombstone: document deleted     │
//!        ▼                         └───────────────────────────────────┘
//! snapshot + replay(updates)
//! ```
//!
//! All writes for one document come from that document's writer task, so
//! implementations never see concurrent writers for the same key.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig};

use thiserror::Error;

use crate::protocol::DocumentId;

/// Storage errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("document {0} has been deleted")]
    Tombstoned(DocumentId),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Persisted state of one document: the latest snapshot plus the encoded
/// batches appended since, in append order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredDocument {
    pub snapshot: Option<Vec<u8>>,
    pub updates: Vec<Vec<u8>>,
}

/// Named binary blobs keyed by document id.
pub trait SnapshotStore: Send + Sync {
    /// `Ok(None)` for a document never written; `Err(Tombstoned)` once deleted.
    fn load(&self, doc: DocumentId) -> Result<Option<StoredDocument>, StoreError>;

    /// Overwrite the snapshot and drop the update log it supersedes.
    fn put_snapshot(&self, doc: DocumentId, snapshot: &[u8]) -> Result<(), StoreError>;

    /// Append one encoded batch to the update log. Returns its sequence number.
    fn append_update(&self, doc: DocumentId, update: &[u8]) -> Result<u64, StoreError>;

    /// Mark the document deleted and discard its content.
    fn tombstone(&self, doc: DocumentId) -> Result<(), StoreError>;

    fn is_tombstoned(&self, doc: DocumentId) -> Result<bool, StoreError>;

    /// Live (non-deleted) documents, for recovery on startup.
    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError>;
}
