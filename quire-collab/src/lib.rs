//! # quire-collab: Collaborative document sync core for Quire
//!
//! Real-time co-editing of rich-text documents over WebSockets, plus a
//! reactive cache for structured records kept in step with a server
//! authority through optimistic mutations.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   /documents/{id}   ┌──────────────────┐
//! │ SyncClient  │ ◄─────────────────► │ Coordinator      │
//! │ (per user)  │   SyncMessage       │  room per doc    │
//! └──────┬──────┘                     └────────┬─────────┘
//!        │                                     │
//!        ▼                                     ▼
//! ┌─────────────┐                     ┌──────────────────┐
//! │ RichText    │                     │ RichText (auth.) │
//! │ Document    │                     │ + SnapshotStore  │
//! └─────────────┘                     └──────────────────┘
//!
//! ┌─────────────┐   /mutations        ┌──────────────────┐
//! │ SyncCache   │ ◄─────────────────► │ MutationAuthority│
//! │ live queries│   JSON frames       │ (EntityStore)    │
//! └─────────────┘                     └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`crdt`]: Home-grown sequence CRDT with marks and document attributes
//! - [`awareness`]: Ephemeral cursors and selections
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`]: Room fan-out with lag accounting
//! - [`coordinator`]: WebSocket server: sessions, rooms, persistence
//! - [`client`]: WebSocket sync client with reconnect supervisor
//! - [`mutation`]: Mutators, authority, pending queue and reactive cache
//! - [`context`]: Per-identity wiring of cache, transport and clients
//! - [`storage`]: Snapshot and update-log stores (memory, RocksDB)

pub mod auth;
pub mod awareness;
pub mod backoff;
pub mod broadcast;
pub mod client;
pub mod context;
pub mod coordinator;
pub mod crdt;
pub mod mutation;
pub mod protocol;
pub mod storage;

// Re-exports for convenience
pub use auth::{AuthDecision, AuthFailure, Authorizer, DocumentScope, Identity, TokenGrant, TokenTable};
pub use awareness::{Awareness, AwarenessState, AwarenessUpdate, ClientId, Selection};
pub use backoff::BackoffPolicy;
pub use broadcast::{BroadcastGroup, BroadcastStats, ConnectionId};
pub use client::{ClientConfig, ConnectError, ConnectionState, SyncClient, SyncEvent};
pub use context::{ContextError, SyncContext};
pub use coordinator::{
    Alert, AlertSink, CollectingAlertSink, Coordinator, CoordinatorConfig, CoordinatorStats, LogAlertSink, SessionState,
};
pub use crdt::{CrdtError, Edit, MergeOutcome, OperationBatch, Replica, ReplicaId, RichTextDocument, StateVector};
pub use mutation::{
    ConfirmedState, Effect, EntityKind, EntityStore, LiveQuery, MutationAuthority, MutationFailure, MutationHandle, MutationRequest,
    MutationResponse, MutatorRegistry, QuerySpec, Record, SyncCache,
};
pub use protocol::{DocumentId, MessageType, ProtocolError, RejectReason, SyncMessage};
pub use storage::{DocumentStore, MemoryStore, SnapshotStore, StoreConfig, StoreError};
