//! WebSocket sync client for one document.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect supervisor)
//! - A local replica that applies edits immediately and merges remote batches
//! - Awareness (cursor/selection) updates
//! - Offline editing: edits made while disconnected stay in the replica and
//!   are pushed when the coordinator's state vector shows it lacks them

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::awareness::{Awareness, AwarenessState, AwarenessUpdate, Selection};
use crate::backoff::BackoffPolicy;
use crate::crdt::{Block, CrdtError, Edit, MergeOutcome, OperationBatch, Replica, ReplicaId, RichTextDocument, StateVector};
use crate::protocol::{DocumentId, MessageType, ProtocolError, RejectReason, SyncMessage};

/// Close code the coordinator uses when a document cannot be loaded.
const CLOSE_UNAVAILABLE: u16 = 1011;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_BUFFER: usize = 256;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Coordinator base URL, e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    pub token: String,
    pub document: DocumentId,
    /// CRDT replica id; also used as the awareness client id. Never 0.
    pub replica_id: ReplicaId,
    pub display_name: String,
    /// Ping and awareness refresh interval
    pub heartbeat_interval: Duration,
    pub reconnect: BackoffPolicy,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>, document: DocumentId) -> Self {
        Self {
            server_url: server_url.into(),
            token: token.into(),
            document,
            replica_id: random_replica_id(),
            display_name: "anonymous".to_string(),
            heartbeat_interval: Duration::from_secs(10),
            reconnect: BackoffPolicy::default().unbounded(),
        }
    }

    /// Short heartbeat and millisecond reconnect delays.
    pub fn for_testing(server_url: impl Into<String>, token: impl Into<String>, document: DocumentId) -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(100),
            reconnect: BackoffPolicy::for_testing(),
            ..Self::new(server_url, token, document)
        }
    }

    pub fn with_replica_id(mut self, replica_id: ReplicaId) -> Self {
        self.replica_id = replica_id;
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    fn url(&self) -> String {
        format!(
            "{}/documents/{}?token={}",
            self.server_url.trim_end_matches('/'),
            self.document,
            urlencoding::encode(&self.token)
        )
    }
}

fn random_replica_id() -> ReplicaId {
    Uuid::new_v4().as_u64_pair().0.max(1)
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// The coordinator refused us; not retried.
    Rejected(RejectReason),
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// Initial state received from the coordinator.
    Synced,
    /// A remote batch changed the document.
    RemoteChange(MergeOutcome),
    /// The set of collaborators' awareness states changed.
    AwarenessChanged,
    Rejected(RejectReason),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("connection rejected: {0}")]
    Rejected(RejectReason),
    #[error("document unavailable")]
    Unavailable,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

struct Link {
    generation: u64,
    outgoing: mpsc::UnboundedSender<Message>,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    config: ClientConfig,
    replica: Mutex<RichTextDocument>,
    awareness: Mutex<Awareness>,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Option<Link>>,
    generations: AtomicU64,
    events: mpsc::Sender<SyncEvent>,
    stop: watch::Sender<bool>,
}

/// The sync client.
///
/// Manages a WebSocket connection to the coordinator and a local replica of
/// one document. Cheap handles are not provided; share it behind an `Arc`.
pub struct SyncClient {
    inner: Arc<Inner>,
    events_rx: Mutex<Option<mpsc::Receiver<SyncEvent>>>,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Self {
        let (events, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (stop, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                replica: Mutex::new(RichTextDocument::new(config.replica_id)),
                awareness: Mutex::new(Awareness::new(config.replica_id)),
                config,
                state,
                link: Mutex::new(None),
                generations: AtomicU64::new(0),
                events,
                stop,
            }),
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn document_id(&self) -> DocumentId {
        self.inner.config.document
    }

    /// Take the event receiver (can only be called once).
    pub fn take_events(&self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.events_rx.lock().take()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connect once. Returns after the coordinator has sent its first frame,
    /// so a refused token surfaces here as [`ConnectError::Rejected`].
    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.drop_link();
        self.inner.state.send_replace(ConnectionState::Connecting);
        match self.inner.clone().open().await {
            Ok(()) => Ok(()),
            Err(e) => {
                let state = match e {
                    ConnectError::Rejected(reason) => ConnectionState::Rejected(reason),
                    _ => ConnectionState::Disconnected,
                };
                self.inner.state.send_replace(state);
                Err(e)
            }
        }
    }

    /// Connect and stay connected, reconnecting with backoff. Returns when
    /// [`shutdown`](Self::shutdown) is called, when the coordinator rejects
    /// us, or when the backoff policy gives up.
    pub async fn run(&self) -> Result<(), ConnectError> {
        let policy = self.inner.config.reconnect.clone();
        let mut stop = self.inner.stop.subscribe();
        let mut attempt = 0;
        loop {
            if *stop.borrow() {
                return Ok(());
            }
            match self.connect().await {
                Ok(()) => {
                    attempt = 0;
                    let mut state = self.watch_state();
                    tokio::select! {
                        _ = state.wait_for(|s| *s != ConnectionState::Connected) => {}
                        _ = stop.wait_for(|s| *s) => return Ok(()),
                    }
                    if let ConnectionState::Rejected(reason) = self.state() {
                        return Err(ConnectError::Rejected(reason));
                    }
                    log::info!("document {}: connection lost, reconnecting", self.document_id());
                }
                Err(e @ ConnectError::Rejected(_)) => return Err(e),
                Err(e) if policy.allows(attempt) => {
                    let delay = policy.delay(attempt);
                    log::warn!(
                        "document {}: connect failed (attempt {}): {e}; retrying in {:?}",
                        self.document_id(),
                        attempt + 1,
                        delay
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stop.wait_for(|s| *s) => return Ok(()),
                    }
                }
                Err(e) => return Err(e),
            }
            self.inner.state.send_replace(ConnectionState::Reconnecting);
        }
    }

    /// Apply an edit locally and send it if connected. While offline the
    /// edit waits in the replica until the next handshake.
    pub fn edit(&self, edit: Edit) -> Result<OperationBatch, CrdtError> {
        let batch = self.inner.replica.lock().apply_local_edit(edit)?;
        match SyncMessage::update_from(self.inner.config.document, &batch) {
            Ok(msg) => {
                self.inner.send(&msg);
            }
            Err(e) => log::warn!("document {}: update encode failed: {e}", self.document_id()),
        }
        Ok(batch)
    }

    pub fn insert(&self, index: usize, text: impl Into<String>) -> Result<OperationBatch, CrdtError> {
        self.edit(Edit::Insert {
            index,
            text: text.into(),
        })
    }

    pub fn delete(&self, index: usize, len: usize) -> Result<OperationBatch, CrdtError> {
        self.edit(Edit::Delete { index, len })
    }

    pub fn text(&self) -> String {
        self.inner.replica.lock().text()
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.inner.replica.lock().blocks()
    }

    pub fn state_vector(&self) -> StateVector {
        self.inner.replica.lock().state_vector()
    }

    pub fn snapshot(&self) -> Result<Vec<u8>, CrdtError> {
        self.inner.replica.lock().snapshot()
    }

    /// Read the replica under its lock.
    pub fn with_document<R>(&self, f: impl FnOnce(&RichTextDocument) -> R) -> R {
        f(&self.inner.replica.lock())
    }

    /// Publish our cursor and selection.
    pub fn set_cursor(&self, cursor: Option<usize>, selection: Option<Selection>) {
        let mut state = AwarenessState::new(self.inner.config.replica_id, self.inner.config.display_name.clone());
        state.cursor = cursor;
        state.selection = selection;
        let update = self.inner.awareness.lock().broadcast_local_state(state);
        self.inner.send_awareness(&update);
    }

    /// Every known awareness state, ours included.
    pub fn awareness_states(&self) -> Vec<AwarenessState> {
        self.inner.awareness.lock().states()
    }

    pub fn subscribe_awareness(&self) -> watch::Receiver<Vec<AwarenessState>> {
        self.inner.awareness.lock().subscribe()
    }

    /// Close the connection. Collaborators see our awareness removed.
    pub async fn disconnect(&self) {
        let removal = self.inner.awareness.lock().remove_local();
        self.inner.send_awareness(&removal);
        let outgoing = self.inner.link.lock().as_ref().map(|l| l.outgoing.clone());
        if let Some(outgoing) = outgoing {
            let _ = outgoing.send(Message::Close(None));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.drop_link();
        self.inner.state.send_replace(ConnectionState::Disconnected);
    }

    /// Stop [`run`](Self::run) and disconnect.
    pub async fn shutdown(&self) {
        self.inner.stop.send_replace(true);
        self.disconnect().await;
    }

    fn drop_link(&self) {
        if let Some(link) = self.inner.link.lock().take() {
            for task in link.tasks {
                task.abort();
            }
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.inner.stop.send_replace(true);
        self.drop_link();
    }
}

impl Inner {
    async fn open(self: Arc<Self>) -> Result<(), ConnectError> {
        let url = self.config.url();
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ConnectError::Transport(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        // Accepted connections start with SyncStep2; refused ones with a close.
        let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.next())
            .await
            .map_err(|_| ConnectError::Transport("timed out waiting for the coordinator".into()))?;
        let mut replies = Vec::new();
        match first {
            Some(Ok(Message::Binary(data))) => {
                let msg = SyncMessage::decode(&data).map_err(|e| ConnectError::Protocol(e.to_string()))?;
                if let Some(reply) = self.handle(msg).map_err(|e| ConnectError::Protocol(e.to_string()))? {
                    replies.push(reply);
                }
            }
            Some(Ok(Message::Close(frame))) => {
                let code = frame.map(|f| u16::from(f.code));
                return Err(match code.and_then(RejectReason::from_close_code) {
                    Some(reason) => ConnectError::Rejected(reason),
                    None if code == Some(CLOSE_UNAVAILABLE) => ConnectError::Unavailable,
                    None => ConnectError::Transport(format!("closed during handshake ({code:?})")),
                });
            }
            Some(Ok(other)) => return Err(ConnectError::Protocol(format!("unexpected first frame: {other:?}"))),
            Some(Err(e)) => return Err(ConnectError::Transport(e.to_string())),
            None => return Err(ConnectError::Transport("closed during handshake".into())),
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let (outgoing, mut out_rx) = mpsc::unbounded_channel::<Message>();
        for reply in replies {
            queue(&outgoing, &reply);
        }
        if let Some(update) = self.awareness.lock().refresh_local() {
            if let Ok(msg) = SyncMessage::awareness(self.config.document, &update) {
                queue(&outgoing, &msg);
            }
        }

        // Writer task: forward outgoing channel to the WebSocket
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if sink.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        // Reader task: merge incoming frames, answer handshakes
        let inner = self.clone();
        let replies_tx = outgoing.clone();
        let reader = tokio::spawn(async move {
            let mut rejected = None;
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match SyncMessage::decode(&data).and_then(|m| inner.handle(m)) {
                        Ok(Some(reply)) => {
                            queue(&replies_tx, &reply);
                        }
                        Ok(None) => {}
                        Err(e) => log::warn!("document {}: bad frame: {e}", inner.config.document),
                    },
                    Ok(Message::Close(frame)) => {
                        rejected = frame.and_then(|f| RejectReason::from_close_code(u16::from(f.code)));
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::debug!("document {}: socket error: {e}", inner.config.document);
                        break;
                    }
                }
            }
            inner.link_lost(generation, rejected);
        });

        // Heartbeat task: ping and refresh our awareness entry
        let inner = self.clone();
        let heartbeat_tx = outgoing.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.heartbeat_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !queue(&heartbeat_tx, &SyncMessage::ping(inner.config.document)) {
                    break;
                }
                let refresh = inner.awareness.lock().refresh_local();
                if let Some(update) = refresh {
                    inner.send_awareness(&update);
                }
            }
        });

        *self.link.lock() = Some(Link {
            generation,
            outgoing,
            tasks: vec![writer, reader, heartbeat],
        });
        self.state.send_replace(ConnectionState::Connected);
        self.emit(SyncEvent::Connected);
        log::info!("document {}: connected as replica {}", self.config.document, self.config.replica_id);
        Ok(())
    }

    /// Apply one frame; returns the reply to send, if any.
    fn handle(&self, msg: SyncMessage) -> Result<Option<SyncMessage>, ProtocolError> {
        if msg.doc_id != self.config.document {
            log::debug!("ignoring frame for document {}", msg.doc_id);
            return Ok(None);
        }
        match msg.msg_type {
            MessageType::SyncStep2 | MessageType::Update => {
                let batch = msg.batch()?;
                let outcome = self.replica.lock().apply_remote_batch(&batch)?;
                if outcome.changed() {
                    self.emit(SyncEvent::RemoteChange(outcome));
                }
                if msg.msg_type == MessageType::SyncStep2 {
                    self.emit(SyncEvent::Synced);
                }
                Ok(None)
            }
            MessageType::SyncStep1 => {
                let remote = msg.state_vector()?;
                let missing = self.replica.lock().diff_since(&remote);
                if missing.is_empty() {
                    return Ok(None);
                }
                log::debug!(
                    "document {}: pushing {} ops the coordinator lacks",
                    self.config.document,
                    missing.ops.len()
                );
                Ok(Some(SyncMessage::update_from(self.config.document, &missing)?))
            }
            MessageType::Awareness => {
                let update = msg.awareness_update()?;
                if self.awareness.lock().apply_update(&update) {
                    self.emit(SyncEvent::AwarenessChanged);
                }
                Ok(None)
            }
            MessageType::Ping => Ok(Some(SyncMessage::pong(self.config.document))),
            MessageType::Pong => {
                log::trace!("document {}: pong", self.config.document);
                Ok(None)
            }
        }
    }

    fn link_lost(&self, generation: u64, rejected: Option<RejectReason>) {
        {
            let mut link = self.link.lock();
            if link.as_ref().map(|l| l.generation) != Some(generation) {
                return;
            }
            *link = None;
        }
        match rejected {
            Some(reason) => {
                log::warn!("document {}: closed by coordinator: {reason}", self.config.document);
                self.state.send_replace(ConnectionState::Rejected(reason));
                self.emit(SyncEvent::Rejected(reason));
            }
            None => {
                self.state.send_replace(ConnectionState::Disconnected);
                self.emit(SyncEvent::Disconnected);
            }
        }
    }

    fn send(&self, msg: &SyncMessage) -> bool {
        match self.link.lock().as_ref() {
            Some(link) => queue(&link.outgoing, msg),
            None => false,
        }
    }

    fn send_awareness(&self, update: &AwarenessUpdate) {
        match SyncMessage::awareness(self.config.document, update) {
            Ok(msg) => {
                self.send(&msg);
            }
            Err(e) => log::warn!("awareness encode failed: {e}"),
        }
    }

    fn emit(&self, event: SyncEvent) {
        if self.events.try_send(event).is_err() {
            log::trace!("document {}: event dropped", self.config.document);
        }
    }
}

fn queue(outgoing: &mpsc::UnboundedSender<Message>, msg: &SyncMessage) -> bool {
    match msg.encode() {
        Ok(bytes) => outgoing.send(Message::Binary(bytes.into())).is_ok(),
        Err(e) => {
            log::warn!("frame encode failed: {e}");
            false
        }
    }
}
