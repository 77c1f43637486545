//! Collaboration coordinator: the WebSocket server that hosts documents.
//!
//! Architecture:
//! ```text
//! Client A ──┐                ┌── Room (doc 1) ── RichTextDocument ── BroadcastGroup
//!            ├── Session ─────┤                          │
//! Client B ──┘   (auth, ping) │                          └── PersistenceWriter ── SnapshotStore
//!                             └── Room (doc 2) ...
//! Cache C ───── /mutations ────── MutationAuthority
//! ```
//!
//! Each connection is a [`Session`] task; each open document is a room task
//! that owns its replica. Sessions talk to rooms over channels only.

mod mutations;
mod persistence;
mod room;
pub mod session;
mod stats;

pub use persistence::{Alert, AlertSink, CollectingAlertSink, LogAlertSink};
pub use room::SERVER_REPLICA;
pub use session::{parse_route, Route, Session, SessionError, SessionState};
pub use stats::CoordinatorStats;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};

use crate::auth::Authorizer;
use crate::backoff::BackoffPolicy;
use crate::broadcast::ConnectionId;
use crate::mutation::MutationAuthority;
use crate::protocol::DocumentId;
use crate::storage::{MemoryStore, SnapshotStore, StoreError};
use room::{RoomCommand, RoomRegistry};
use stats::StatsCounters;

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Quiet period after the last update before it is written
    pub flush_debounce: Duration,
    /// Write a snapshot instead of an update every this many flushes
    pub snapshot_every_flushes: u64,
    /// Interval of the idle check and room housekeeping
    pub heartbeat_interval: Duration,
    /// Connections silent this long are closed
    pub idle_timeout: Duration,
    /// Awareness states not refreshed this long are dropped
    pub awareness_timeout: Duration,
    /// Retries for storage writes and loads
    pub persistence_backoff: BackoffPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            flush_debounce: Duration::from_secs(2),
            snapshot_every_flushes: 10,
            heartbeat_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            awareness_timeout: Duration::from_secs(30),
            persistence_backoff: BackoffPolicy::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Ephemeral port and short timers.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            broadcast_capacity: 64,
            flush_debounce: Duration::from_millis(50),
            snapshot_every_flushes: 3,
            heartbeat_interval: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(5),
            awareness_timeout: Duration::from_secs(5),
            persistence_backoff: BackoffPolicy::for_testing(),
        }
    }
}

/// State shared by every session and room of one coordinator.
pub(crate) struct Shared {
    pub config: CoordinatorConfig,
    pub authorizer: Arc<dyn Authorizer>,
    pub store: Arc<dyn SnapshotStore>,
    pub alerts: Arc<dyn AlertSink>,
    pub stats: Arc<StatsCounters>,
    pub rooms: RoomRegistry,
    pub authority: Option<Arc<MutationAuthority>>,
    next_connection: AtomicU64,
}

impl Shared {
    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection.fetch_add(1, Ordering::Relaxed) + 1
    }
}

pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    authorizer: Arc<dyn Authorizer>,
    store: Option<Arc<dyn SnapshotStore>>,
    alerts: Option<Arc<dyn AlertSink>>,
    authority: Option<Arc<MutationAuthority>>,
}

impl CoordinatorBuilder {
    /// Defaults to an in-memory store.
    pub fn store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to [`LogAlertSink`].
    pub fn alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Serve `/mutations` from this authority.
    pub fn mutation_authority(mut self, authority: Arc<MutationAuthority>) -> Self {
        self.authority = Some(authority);
        self
    }

    pub fn build(self) -> Coordinator {
        let (shutdown, _) = watch::channel(false);
        Coordinator {
            shared: Arc::new(Shared {
                config: self.config,
                authorizer: self.authorizer,
                store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
                alerts: self.alerts.unwrap_or_else(|| Arc::new(LogAlertSink)),
                stats: Arc::new(StatsCounters::default()),
                rooms: RoomRegistry::default(),
                authority: self.authority,
                next_connection: AtomicU64::new(0),
            }),
            shutdown: Arc::new(shutdown),
        }
    }
}

/// The coordinator. Cheap to clone; clones share every room and counter.
#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Coordinator {
    pub fn builder(config: CoordinatorConfig, authorizer: Arc<dyn Authorizer>) -> CoordinatorBuilder {
        CoordinatorBuilder {
            config,
            authorizer,
            store: None,
            alerts: None,
            authority: None,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(&self.shared.config.bind_addr).await
    }

    /// Accept connections until [`shutdown`](Self::shutdown).
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let local: SocketAddr = listener.local_addr()?;
        log::info!("Coordinator listening on {local}");
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");
                    let shared = self.shared.clone();
                    tokio::spawn(async move {
                        if let Err(e) = session::handle_connection(shared, stream, addr).await {
                            log::debug!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }
        log::info!("Coordinator on {local} stopped accepting");
        Ok(())
    }

    /// Bind the configured address and serve.
    pub async fn run(&self) -> std::io::Result<()> {
        let known = self.known_documents().await.map(|d| d.len()).unwrap_or(0);
        if known > 0 {
            log::info!("{known} documents available from storage");
        }
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    pub fn stats(&self) -> CoordinatorStats {
        let mut stats = self.shared.stats.snapshot();
        stats.committed_mutations = self.shared.authority.as_ref().map_or(0, |a| a.committed_count());
        stats
    }

    /// Every live document: stored ones plus those only open in memory.
    pub async fn known_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let store = self.shared.store.clone();
        let mut documents = tokio::task::spawn_blocking(move || store.list_documents())
            .await
            .map_err(|e| StoreError::Unavailable(format!("list task failed: {e}")))??;
        documents.extend(self.shared.rooms.documents());
        documents.sort();
        documents.dedup();
        Ok(documents)
    }

    /// Documents with an open room.
    pub fn active_documents(&self) -> Vec<DocumentId> {
        self.shared.rooms.documents()
    }

    /// Tombstone `document` and disconnect its sessions with close code 4410.
    pub async fn delete_document(&self, document: DocumentId) -> Result<(), StoreError> {
        let store = self.shared.store.clone();
        tokio::task::spawn_blocking(move || store.tombstone(document))
            .await
            .map_err(|e| StoreError::Unavailable(format!("tombstone task failed: {e}")))??;
        if let Some(room) = self.shared.rooms.get(document) {
            room.send(RoomCommand::Delete);
        }
        log::info!("document {document} deleted");
        Ok(())
    }

    /// Stop accepting, then flush and close every room.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        for room in self.shared.rooms.handles() {
            let (done, closed) = oneshot::channel();
            if room.send(RoomCommand::Shutdown { done }) {
                let _ = closed.await;
            }
        }
        log::info!("Coordinator shut down ({} rooms still registered)", self.shared.rooms.len());
    }
}
