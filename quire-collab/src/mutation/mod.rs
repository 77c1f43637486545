//! Optimistic mutations over structured metadata (documents, folders,
//! collections) and their reconciliation with the server.
//!
//! ```text
//!  SyncCache.mutate("document.rename", args)
//!     │  execute locally against the view ──► LiveQuery subscribers
//!     ▼
//!  PendingQueue (seq 1, 2, 3 ...) ──dispatcher──► MutationTransport
//!                                                     │
//!                                          MutationAuthority (server)
//!                                             in-order, idempotent
//!                                                     │
//!  confirmed store ◄── committed effect / rejection ◄─┘
//! ```
//!
//! Every commit gets the next authority version. Caches fold committed
//! effects into their confirmed store strictly in version order, whether an
//! effect arrives as a response or as a push, and fall back to fetching a
//! [`ConfirmedState`] when a version goes missing.
//!
//! Mutators are pure functions of `(store, args, context)`. The context holds
//! the only inputs allowed to differ between the client's guess and the
//! server's canonical run.

pub mod authority;
pub mod cache;
pub mod mutators;
pub mod query;
pub mod queue;
pub mod record;
pub mod transport;

pub use authority::MutationAuthority;
pub use cache::{LiveQuery, MutationHandle, SyncCache};
pub use mutators::{Mutator, MutatorRegistry};
pub use query::{QuerySpec, Sort};
pub use queue::{PendingEntry, PendingQueue, PendingStatus};
pub use record::{Change, Effect, EntityKind, EntityStore, Record};
pub use transport::{LocalTransport, MutationTransport, ServerPush, TransportError, WsMutationTransport};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Client-chosen id of one mutation, stable across resends.
pub type MutationId = Uuid;

/// Milliseconds since the Unix epoch.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    })
}

/// A clock frozen at `ms`, for tests.
pub fn fixed_clock(ms: u64) -> Clock {
    Arc::new(move || ms)
}

/// Where a mutator is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// Optimistic run in a client cache.
    Client,
    /// Canonical run in the authority.
    Server,
}

/// Nondeterministic inputs to a mutator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationContext {
    pub client_id: String,
    pub now_ms: u64,
    pub side: Side,
}

/// Why a mutator refused to run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    #[error("unknown mutation: {0}")]
    UnknownMutation(String),
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("duplicate: {0}")]
    Duplicate(String),
}

impl MutationError {
    /// Stable machine-readable reason carried in rejected responses.
    pub fn reason(&self) -> &'static str {
        match self {
            MutationError::UnknownMutation(_) => "unknown_mutation",
            MutationError::InvalidArgs(_) => "invalid_args",
            MutationError::NotFound(_) => "not_found",
            MutationError::AlreadyExists(_) => "exists",
            MutationError::Duplicate(_) => "duplicate",
        }
    }
}

/// A mutation the server refused (or a local refusal before sending).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("mutation rejected: {reason}")]
pub struct MutationFailure {
    pub reason: String,
    pub message: Option<String>,
}

impl From<MutationError> for MutationFailure {
    fn from(err: MutationError) -> Self {
        Self {
            reason: err.reason().to_string(),
            message: Some(err.to_string()),
        }
    }
}

/// What the client sends for one mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    pub mutation_name: String,
    pub args: Value,
    pub client_id: String,
    /// Random per-queue id. A client id reused by a fresh cache starts a new
    /// sequence instead of colliding with the old one.
    #[serde(default)]
    pub epoch: Uuid,
    pub client_mutation_id: MutationId,
    /// Per-client issue order, starting at 1.
    pub sequence_number: u64,
    /// Client's clock at issue time; informational only.
    pub issued_at_ms: u64,
    /// Highest sequence number the client holds a final response for, so the
    /// authority can forget those responses.
    #[serde(default)]
    pub acknowledged_through: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Committed,
    Rejected,
}

/// The authority's answer to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationResponse {
    pub client_mutation_id: MutationId,
    pub sequence_number: u64,
    pub status: MutationStatus,
    /// Authority version the commit produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<Effect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl MutationResponse {
    pub fn committed(request: &MutationRequest, version: u64, effect: Effect) -> Self {
        Self {
            client_mutation_id: request.client_mutation_id,
            sequence_number: request.sequence_number,
            status: MutationStatus::Committed,
            version: Some(version),
            effect: Some(effect),
            reason: None,
        }
    }

    pub fn rejected(request: &MutationRequest, reason: impl Into<String>) -> Self {
        Self {
            client_mutation_id: request.client_mutation_id,
            sequence_number: request.sequence_number,
            status: MutationStatus::Rejected,
            version: None,
            effect: None,
            reason: Some(reason.into()),
        }
    }

    /// Collapse into the caller-facing result.
    pub fn into_result(self) -> Result<Effect, MutationFailure> {
        match self.status {
            MutationStatus::Committed => Ok(self.effect.unwrap_or_default()),
            MutationStatus::Rejected => Err(MutationFailure {
                reason: self.reason.unwrap_or_else(|| "rejected".to_string()),
                message: None,
            }),
        }
    }
}

/// A committed effect pushed to every connected client, the issuer included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushedEffect {
    /// Client that issued the mutation.
    pub client_id: String,
    pub client_mutation_id: MutationId,
    pub version: u64,
    pub effect: Effect,
}

/// The authority's whole store as of `version`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfirmedState {
    pub version: u64,
    pub records: Vec<Record>,
}

/// JSON text frames on the `/mutations` WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MutationFrame {
    Request(MutationRequest),
    Response(MutationResponse),
    Effect(PushedEffect),
    /// Client asks for a [`MutationFrame::State`].
    Resync,
    /// Sent on request, and unprompted when the server dropped pushes.
    State(ConfirmedState),
}

impl MutationFrame {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
