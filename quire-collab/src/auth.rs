//! Authorization boundary between the coordinator and the identity provider.
//!
//! The coordinator asks `(token, document) -> allow | deny` on every new
//! connection attempt and again on every persistence flush. Nothing is cached
//! here; revoking or expiring a token takes effect at the next check.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::protocol::{DocumentId, RejectReason};

/// Who a token belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into() }
    }
}

/// Why a token was refused.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("not authorized for this document")]
    Forbidden,
}

impl AuthFailure {
    pub fn reject_reason(self) -> RejectReason {
        match self {
            AuthFailure::InvalidToken => RejectReason::InvalidToken,
            AuthFailure::Forbidden => RejectReason::Forbidden,
        }
    }
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allow(Identity),
    Deny(AuthFailure),
}

impl AuthDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthDecision::Allow(_))
    }
}

/// External identity/authorization collaborator.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Check `token` for access to `document`. `None` checks the token alone
    /// (used by the mutation endpoint, which is not scoped to a document).
    async fn authorize(&self, token: &str, document: Option<DocumentId>) -> AuthDecision;
}

/// Which documents a token may open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentScope {
    All,
    Only(HashSet<DocumentId>),
}

impl DocumentScope {
    fn permits(&self, document: DocumentId) -> bool {
        match self {
            DocumentScope::All => true,
            DocumentScope::Only(docs) => docs.contains(&document),
        }
    }
}

/// One issued token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub user_id: String,
    pub scope: DocumentScope,
    /// Seconds since the Unix epoch; `None` never expires.
    #[serde(default)]
    pub expires_at: Option<u64>,
}

/// In-memory token table: the authorizer used by the server binary and tests.
#[derive(Debug, Default)]
pub struct TokenTable {
    grants: RwLock<HashMap<String, TokenGrant>>,
}

impl TokenTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a `{token: grant}` map, e.g. parsed from a JSON file.
    pub fn from_grants(grants: HashMap<String, TokenGrant>) -> Self {
        Self {
            grants: RwLock::new(grants),
        }
    }

    pub fn grant(&self, token: impl Into<String>, user_id: impl Into<String>, scope: DocumentScope) {
        self.grants.write().insert(
            token.into(),
            TokenGrant {
                user_id: user_id.into(),
                scope,
                expires_at: None,
            },
        );
    }

    pub fn grant_until(&self, token: impl Into<String>, user_id: impl Into<String>, scope: DocumentScope, expires_at: u64) {
        self.grants.write().insert(
            token.into(),
            TokenGrant {
                user_id: user_id.into(),
                scope,
                expires_at: Some(expires_at),
            },
        );
    }

    /// Remove a token; live sessions using it are dropped at their next check.
    pub fn revoke(&self, token: &str) -> bool {
        self.grants.write().remove(token).is_some()
    }

    pub fn len(&self) -> usize {
        self.grants.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.read().is_empty()
    }

    fn check(&self, token: &str, document: Option<DocumentId>, now_secs: u64) -> AuthDecision {
        let grants = self.grants.read();
        let Some(grant) = grants.get(token) else {
            return AuthDecision::Deny(AuthFailure::InvalidToken);
        };
        if grant.expires_at.is_some_and(|at| now_secs >= at) {
            return AuthDecision::Deny(AuthFailure::InvalidToken);
        }
        if document.is_some_and(|doc| !grant.scope.permits(doc)) {
            return AuthDecision::Deny(AuthFailure::Forbidden);
        }
        AuthDecision::Allow(Identity::new(grant.user_id.clone()))
    }
}

#[async_trait]
impl Authorizer for TokenTable {
    async fn authorize(&self, token: &str, document: Option<DocumentId>) -> AuthDecision {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.check(token, document, now)
    }
}
