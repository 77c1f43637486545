//! Binary protocol for document synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────────────────────────┐
//! │ msg_type │ doc_id   │ clock    │ payload                      │
//! │ 1 byte   │ 16 bytes │ varint   │ state vector / batch / aware │
//! └──────────┴──────────┴──────────┴──────────────────────────────┘
//! ```
//!
//! Handshake: after authorization the coordinator sends `SyncStep2` (its full
//! state) and `SyncStep1` (its state vector). Either side answers a
//! `SyncStep1` with a `SyncStep2` carrying what the other side is missing.
//! From then on edits travel as `Update` frames.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::awareness::AwarenessUpdate;
use crate::crdt::{CrdtError, OperationBatch, StateVector};

/// Identity of a collaborative document.
pub type DocumentId = Uuid;

const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// State vector announcing what the sender already has
    SyncStep1 = 1,
    /// Operations the receiver is missing
    SyncStep2 = 2,
    /// Incremental operation batch
    Update = 3,
    /// Ephemeral presence update
    Awareness = 4,
    /// Heartbeat ping
    Ping = 5,
    /// Heartbeat pong
    Pong = 6,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub doc_id: DocumentId,
    /// Sender's Lamport clock (0 when not meaningful)
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Create a sync step 1 (state vector announcement).
    pub fn sync_step1(doc_id: DocumentId, sv: &StateVector) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::SyncStep1,
            doc_id,
            clock: 0,
            payload: sv.encode()?,
        })
    }

    /// Create a sync step 2 (missing operations).
    pub fn sync_step2(doc_id: DocumentId, batch: &OperationBatch) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::SyncStep2,
            doc_id,
            clock: batch.clock,
            payload: batch.encode()?,
        })
    }

    /// Create an update message from an already-encoded batch.
    pub fn update(doc_id: DocumentId, clock: u64, encoded_batch: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Update,
            doc_id,
            clock,
            payload: encoded_batch,
        }
    }

    /// Create an update message from a batch.
    pub fn update_from(doc_id: DocumentId, batch: &OperationBatch) -> Result<Self, ProtocolError> {
        Ok(Self::update(doc_id, batch.clock, batch.encode()?))
    }

    /// Create an awareness message.
    pub fn awareness(doc_id: DocumentId, update: &AwarenessUpdate) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Awareness,
            doc_id,
            clock: update.clock(),
            payload: update.encode()?,
        })
    }

    pub fn ping(doc_id: DocumentId) -> Self {
        Self {
            msg_type: MessageType::Ping,
            doc_id,
            clock: 0,
            payload: Vec::new(),
        }
    }

    pub fn pong(doc_id: DocumentId) -> Self {
        Self {
            msg_type: MessageType::Pong,
            doc_id,
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(
            bytes,
            bincode::config::standard().with_limit::<MAX_MESSAGE_BYTES>(),
        )
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse a `SyncStep1` payload.
    pub fn state_vector(&self) -> Result<StateVector, ProtocolError> {
        self.expect(MessageType::SyncStep1)?;
        Ok(StateVector::decode(&self.payload)?)
    }

    /// Parse a `SyncStep2` or `Update` payload.
    pub fn batch(&self) -> Result<OperationBatch, ProtocolError> {
        if !matches!(self.msg_type, MessageType::SyncStep2 | MessageType::Update) {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        Ok(OperationBatch::decode(&self.payload)?)
    }

    /// Parse an `Awareness` payload.
    pub fn awareness_update(&self) -> Result<AwarenessUpdate, ProtocolError> {
        self.expect(MessageType::Awareness)?;
        AwarenessUpdate::decode(&self.payload)
    }

    fn expect(&self, msg_type: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type != msg_type {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        Ok(())
    }
}

/// Why the coordinator refused or ended a document connection. Each maps to a
/// distinct WebSocket close code so clients can tell them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// Path is not `/documents/{uuid}`.
    MalformedPath,
    /// No `token` query parameter.
    MissingToken,
    /// Token unknown or expired.
    InvalidToken,
    /// Token valid but not for this document.
    Forbidden,
    /// Document has been deleted.
    DocumentDeleted,
}

impl RejectReason {
    pub const ALL: [RejectReason; 5] = [
        RejectReason::MalformedPath,
        RejectReason::MissingToken,
        RejectReason::InvalidToken,
        RejectReason::Forbidden,
        RejectReason::DocumentDeleted,
    ];

    pub fn close_code(self) -> u16 {
        match self {
            RejectReason::MalformedPath => 4400,
            RejectReason::MissingToken => 4401,
            RejectReason::InvalidToken => 4402,
            RejectReason::Forbidden => 4403,
            RejectReason::DocumentDeleted => 4410,
        }
    }

    pub fn from_close_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.close_code() == code)
    }

    pub fn description(self) -> &'static str {
        match self {
            RejectReason::MalformedPath => "malformed document path",
            RejectReason::MissingToken => "missing token",
            RejectReason::InvalidToken => "invalid or expired token",
            RejectReason::Forbidden => "not authorized for this document",
            RejectReason::DocumentDeleted => "document deleted",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.description(), self.close_code())
    }
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected message type {0:?}")]
    InvalidMessageType(MessageType),
    #[error(transparent)]
    Crdt(#[from] CrdtError),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection timeout")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::AwarenessState;
    use crate::crdt::{Edit, Replica, RichTextDocument};

    #[test]
    fn test_update_roundtrip_carries_batch() {
        let doc = Uuid::new_v4();
        let mut replica = RichTextDocument::new(3);
        let batch = replica.apply_local_edit(Edit::Insert { index: 0, text: "hi".into() }).unwrap();

        let msg = SyncMessage::update_from(doc, &batch).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Update);
        assert_eq!(decoded.doc_id, doc);
        assert_eq!(decoded.clock, batch.clock);
        assert_eq!(decoded.batch().unwrap(), batch);
    }

    #[test]
    fn test_sync_step1_carries_state_vector() {
        let mut replica = RichTextDocument::new(3);
        replica.apply_local_edit(Edit::Insert { index: 0, text: "abc".into() }).unwrap();

        let msg = SyncMessage::sync_step1(Uuid::nil(), &replica.state_vector()).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.state_vector().unwrap().get(3), 3);
    }

    #[test]
    fn test_awareness_payload() {
        let update = AwarenessUpdate::Update(AwarenessState::new(5, "Alice"));
        let msg = SyncMessage::awareness(Uuid::nil(), &update).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.awareness_update().unwrap(), update);
    }

    #[test]
    fn test_wrong_payload_accessor() {
        let ping = SyncMessage::ping(Uuid::nil());
        assert_eq!(ping.batch(), Err(ProtocolError::InvalidMessageType(MessageType::Ping)));
        assert!(ping.state_vector().is_err());
        assert!(ping.awareness_update().is_err());
    }

    #[test]
    fn test_corrupt_batch_payload_is_an_error() {
        let msg = SyncMessage::update(Uuid::nil(), 1, vec![1, 0xFF, 0xFF, 0xFF]);
        assert!(matches!(msg.batch(), Err(ProtocolError::Crdt(_))));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SyncMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::SyncStep1 as u8, 1);
        assert_eq!(MessageType::SyncStep2 as u8, 2);
        assert_eq!(MessageType::Update as u8, 3);
        assert_eq!(MessageType::Awareness as u8, 4);
        assert_eq!(MessageType::Ping as u8, 5);
        assert_eq!(MessageType::Pong as u8, 6);
    }

    #[test]
    fn test_reject_codes_are_distinct() {
        for reason in RejectReason::ALL {
            assert_eq!(RejectReason::from_close_code(reason.close_code()), Some(reason));
        }
        assert_eq!(RejectReason::Forbidden.close_code(), 4403);
        assert_eq!(RejectReason::from_close_code(1000), None);
    }

    #[test]
    fn test_update_frame_size_efficient() {
        let msg = SyncMessage::update(Uuid::new_v4(), 1, vec![0u8; 50]);
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() < 100, "encoded size {} too large", encoded.len());
    }
}
