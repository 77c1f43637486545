//! Per-process sync context: owns the mutation transport and cache for one
//! identity and opens document clients with the same credentials.
//!
//! ```text
//! SyncContext::create(url, token, client_id)
//!     ├── WsMutationTransport ── /mutations
//!     ├── SyncCache (live queries, pending mutations)
//!     └── open_document(id) ──► SyncClient ── /documents/{id}
//! ```
//!
//! Switching users goes through [`SyncContext::reconfigure_for_identity`],
//! which closes the old cache (failing its pending mutations) before the new
//! one is built.

use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backoff::BackoffPolicy;
use crate::client::{ClientConfig, SyncClient};
use crate::mutation::{MutationTransport, MutatorRegistry, ServerPush, SyncCache, TransportError, WsMutationTransport};
use crate::protocol::DocumentId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("context has no coordinator url")]
    NoServer,
    #[error("context closed")]
    Closed,
}

enum Backend {
    /// Coordinator over WebSockets; a transport per identity.
    Remote { server_url: String, reconnect: BackoffPolicy },
    /// A fixed transport, e.g. in-process.
    Fixed(Arc<dyn MutationTransport>),
}

struct Active {
    token: String,
    cache: Arc<SyncCache>,
    transport: Option<Arc<WsMutationTransport>>,
    pump: Option<JoinHandle<()>>,
}

impl Active {
    fn shut(self) {
        self.cache.close();
        if let Some(pump) = self.pump {
            pump.abort();
        }
        if let Some(transport) = self.transport {
            transport.disconnect();
        }
    }
}

pub struct SyncContext {
    backend: Backend,
    registry: MutatorRegistry,
    active: Option<Active>,
}

impl SyncContext {
    /// Connect the mutation channel for `token` and build an empty cache.
    pub async fn create(
        server_url: impl Into<String>,
        token: impl Into<String>,
        client_id: impl Into<String>,
        registry: MutatorRegistry,
    ) -> Result<Self, ContextError> {
        let mut context = Self {
            backend: Backend::Remote {
                server_url: server_url.into(),
                reconnect: BackoffPolicy::default().unbounded(),
            },
            registry,
            active: None,
        };
        context.reconfigure_for_identity(token, client_id).await?;
        Ok(context)
    }

    /// A context over an existing transport. Documents cannot be opened.
    pub fn with_transport(client_id: impl Into<String>, registry: MutatorRegistry, transport: Arc<dyn MutationTransport>) -> Self {
        let cache = Arc::new(SyncCache::new(client_id, registry.clone(), transport.clone()));
        Self {
            backend: Backend::Fixed(transport),
            registry,
            active: Some(Active {
                token: String::new(),
                cache,
                transport: None,
                pump: None,
            }),
        }
    }

    /// Reconnect delays for remote transports.
    pub fn set_reconnect_policy(&mut self, policy: BackoffPolicy) {
        if let Backend::Remote { reconnect, .. } = &mut self.backend {
            *reconnect = policy;
        }
    }

    /// Drop everything tied to the current identity and start over as
    /// `client_id`, loaded with the authority's current state. Pending
    /// mutations of the old identity fail with `cache_closed`; none are
    /// carried over.
    pub async fn reconfigure_for_identity(&mut self, token: impl Into<String>, client_id: impl Into<String>) -> Result<(), ContextError> {
        let token = token.into();
        let client_id = client_id.into();
        if let Some(old) = self.active.take() {
            log::info!("sync context: switching from {} to {client_id}", old.cache.client_id());
            old.shut();
        }

        let active = match &self.backend {
            Backend::Fixed(transport) => Active {
                token,
                cache: Arc::new(SyncCache::new(client_id, self.registry.clone(), transport.clone())),
                transport: None,
                pump: None,
            },
            Backend::Remote { server_url, reconnect } => {
                let transport = Arc::new(WsMutationTransport::new(server_url, &token));
                transport.connect().await?;
                let cache = Arc::new(SyncCache::new(client_id, self.registry.clone(), transport.clone()));
                let pump = spawn_pump(transport.clone(), Arc::downgrade(&cache), reconnect.clone());
                Active {
                    token,
                    cache,
                    transport: Some(transport),
                    pump: Some(pump),
                }
            }
        };
        if let Err(e) = active.cache.resync().await {
            active.shut();
            return Err(e.into());
        }
        self.active = Some(active);
        Ok(())
    }

    /// The cache for the current identity.
    pub fn cache(&self) -> Result<Arc<SyncCache>, ContextError> {
        self.active.as_ref().map(|a| a.cache.clone()).ok_or(ContextError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.active.is_none()
    }

    /// A document client with the current credentials. Not yet connected.
    pub fn open_document(&self, document: DocumentId) -> Result<SyncClient, ContextError> {
        let active = self.active.as_ref().ok_or(ContextError::Closed)?;
        let Backend::Remote { server_url, .. } = &self.backend else {
            return Err(ContextError::NoServer);
        };
        let config =
            ClientConfig::new(server_url.clone(), active.token.clone(), document).with_display_name(active.cache.client_id());
        Ok(SyncClient::new(config))
    }

    /// Close the cache and the mutation channel. Idempotent.
    pub fn close(&mut self) {
        if let Some(active) = self.active.take() {
            log::info!("sync context for {} closed", active.cache.client_id());
            active.shut();
        }
    }
}

impl Drop for SyncContext {
    fn drop(&mut self) {
        self.close();
    }
}

/// Feed server pushes into the cache and re-open the transport when the
/// link drops, resuming the cache's dispatcher afterwards.
fn spawn_pump(transport: Arc<WsMutationTransport>, cache: Weak<SyncCache>, policy: BackoffPolicy) -> JoinHandle<()> {
    let mut effects = transport.take_effects();
    let mut link = transport.watch_connection();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(push) = next_push(&mut effects) => match cache.upgrade() {
                    Some(cache) => cache.apply_push(push),
                    None => break,
                },
                changed = link.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *link.borrow_and_update() {
                        continue;
                    }
                    if let Some(reason) = transport.rejection() {
                        log::warn!("mutation channel rejected: {reason}");
                        break;
                    }
                    if !reconnect(&transport, &policy).await {
                        break;
                    }
                    match cache.upgrade() {
                        Some(cache) => cache.reconnect(),
                        None => break,
                    }
                }
            }
        }
    })
}

async fn reconnect(transport: &WsMutationTransport, policy: &BackoffPolicy) -> bool {
    let mut attempt = 0;
    loop {
        let delay = policy.delay(attempt);
        tokio::time::sleep(delay).await;
        match transport.connect().await {
            Ok(()) => return true,
            Err(TransportError::Rejected(reason)) => {
                log::warn!("mutation channel rejected: {reason}");
                return false;
            }
            Err(e) if policy.allows(attempt) => {
                log::warn!("mutation channel reconnect failed (attempt {}): {e}", attempt + 1);
                attempt += 1;
            }
            Err(e) => {
                log::error!("mutation channel gave up: {e}");
                return false;
            }
        }
    }
}

async fn next_push(effects: &mut Option<mpsc::UnboundedReceiver<ServerPush>>) -> Option<ServerPush> {
    match effects {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::{LocalTransport, MutationAuthority, QuerySpec, EntityKind};
    use serde_json::json;

    fn local() -> (Arc<LocalTransport>, SyncContext) {
        let registry = MutatorRegistry::with_builtins();
        let authority = Arc::new(MutationAuthority::new(registry.clone()));
        let transport = Arc::new(LocalTransport::new(authority));
        let context = SyncContext::with_transport("alice", registry, transport.clone());
        (transport, context)
    }

    #[tokio::test]
    async fn test_cache_is_tied_to_identity() {
        let (transport, mut context) = local();
        let cache = context.cache().unwrap();
        cache
            .mutate("folder.create", json!({"id": "f1", "name": "Inbox"}))
            .unwrap()
            .confirmed()
            .await
            .unwrap();

        context.reconfigure_for_identity("", "bob").await.unwrap();
        let cache = context.cache().unwrap();
        assert_eq!(cache.client_id(), "bob");
        assert_eq!(transport.authority().query(&QuerySpec::all(EntityKind::Folder)).len(), 1);
        assert!(matches!(context.open_document(uuid::Uuid::new_v4()), Err(ContextError::NoServer)));
    }

    #[tokio::test]
    async fn test_switching_back_to_earlier_identity() {
        let (transport, mut context) = local();
        for name in ["One", "Two"] {
            context
                .cache()
                .unwrap()
                .mutate("folder.create", json!({"id": name, "name": name}))
                .unwrap()
                .confirmed()
                .await
                .unwrap();
        }

        context.reconfigure_for_identity("", "bob").await.unwrap();
        context.reconfigure_for_identity("", "alice").await.unwrap();
        let cache = context.cache().unwrap();
        assert_eq!(cache.confirmed_version(), 2);
        assert_eq!(cache.view().of_kind(EntityKind::Folder).count(), 2);

        let handle = cache.mutate("folder.create", json!({"id": "Three", "name": "Three"})).unwrap();
        assert_eq!(handle.sequence, 1);
        handle.confirmed().await.unwrap();
        assert_eq!(transport.authority().committed_count(), 3);
    }

    #[tokio::test]
    async fn test_close_fails_pending_mutations() {
        let (transport, mut context) = local();
        transport.set_connected(false);
        let handle = context
            .cache()
            .unwrap()
            .mutate("folder.create", json!({"id": "f1", "name": "Inbox"}))
            .unwrap();

        context.close();
        assert!(context.is_closed());
        assert!(matches!(context.cache(), Err(ContextError::Closed)));
        assert_eq!(handle.confirmed().await.unwrap_err().reason, "cache_closed");
        context.close();
    }
}
