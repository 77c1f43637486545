//! Error types for CRDT operations.

use thiserror::Error;

/// Errors that can occur while editing or merging a replica.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CrdtError {
    /// Edit position out of bounds.
    #[error("edit position {pos} out of bounds for document with length {len}")]
    PositionOutOfBounds { pos: usize, len: usize },

    /// Edit that would produce no operation (empty insert, zero-length range).
    #[error("edit has no effect")]
    EmptyEdit,

    /// Batch bytes could not be decoded.
    #[error("malformed batch: {0}")]
    MalformedBatch(String),

    /// Batch decoded but violates an invariant (zero counter, empty run...).
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// Batch or snapshot written by an unknown format version.
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u8),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}
