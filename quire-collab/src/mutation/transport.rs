//! How a cache's mutations reach the authority.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::authority::MutationAuthority;
use super::{ConfirmedState, MutationFrame, MutationId, MutationRequest, MutationResponse, PushedEffect};
use crate::protocol::RejectReason;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No live link; the request may or may not have reached the server.
    #[error("transport disconnected")]
    Disconnected,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("connection rejected: {0}")]
    Rejected(RejectReason),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Delivers one request and waits for its final response.
#[async_trait]
pub trait MutationTransport: Send + Sync {
    async fn submit(&self, request: MutationRequest) -> Result<MutationResponse, TransportError>;

    /// The authority's current store and version.
    async fn fetch_confirmed(&self) -> Result<ConfirmedState, TransportError>;
}

/// What the server sends without being asked.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerPush {
    Effect(PushedEffect),
    /// Replaces the confirmed store; sent after the server dropped pushes.
    State(ConfirmedState),
}

/// In-process transport straight into a `MutationAuthority`, with knobs to
/// simulate latency and lost links.
pub struct LocalTransport {
    authority: Arc<MutationAuthority>,
    delay: Mutex<Option<Duration>>,
    connected: AtomicBool,
    lose_responses: AtomicU32,
    submissions: AtomicU64,
}

impl LocalTransport {
    pub fn new(authority: Arc<MutationAuthority>) -> Self {
        Self {
            authority,
            delay: Mutex::new(None),
            connected: AtomicBool::new(true),
            lose_responses: AtomicU32::new(0),
            submissions: AtomicU64::new(0),
        }
    }

    pub fn authority(&self) -> &Arc<MutationAuthority> {
        &self.authority
    }

    /// Hold every request this long before it reaches the authority.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// While disconnected, submissions fail without reaching the authority.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// The next `n` requests are executed but their responses are lost, and
    /// the link goes down.
    pub fn lose_next_responses(&self, n: u32) {
        self.lose_responses.store(n, Ordering::SeqCst);
    }

    /// Requests that reached the authority, resends included.
    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MutationTransport for LocalTransport {
    async fn submit(&self, request: MutationRequest) -> Result<MutationResponse, TransportError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }

        self.submissions.fetch_add(1, Ordering::SeqCst);
        let response = self.authority.submit(request).await;

        let lost = self
            .lose_responses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            self.set_connected(false);
            return Err(TransportError::Disconnected);
        }
        Ok(response)
    }

    async fn fetch_confirmed(&self) -> Result<ConfirmedState, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        Ok(self.authority.confirmed_state())
    }
}

type Waiters = Arc<Mutex<HashMap<MutationId, oneshot::Sender<MutationResponse>>>>;
type StateWaiters = Arc<Mutex<Vec<oneshot::Sender<ConfirmedState>>>>;

struct Link {
    outgoing: mpsc::UnboundedSender<Message>,
    tasks: Vec<JoinHandle<()>>,
}

/// Mutation transport over the coordinator's `/mutations` WebSocket.
///
/// Responses are matched to requests by `client_mutation_id`; pushed effects
/// and unprompted state resets come out of [`take_effects`](Self::take_effects).
pub struct WsMutationTransport {
    url: String,
    link: Mutex<Option<Link>>,
    waiters: Waiters,
    state_waiters: StateWaiters,
    effects_tx: mpsc::UnboundedSender<ServerPush>,
    effects_rx: Mutex<Option<mpsc::UnboundedReceiver<ServerPush>>>,
    connected: Arc<watch::Sender<bool>>,
    rejected: Arc<Mutex<Option<RejectReason>>>,
}

impl WsMutationTransport {
    /// `server_url` is the coordinator base, e.g. `ws://127.0.0.1:9090`.
    pub fn new(server_url: &str, token: &str) -> Self {
        let (effects_tx, effects_rx) = mpsc::unbounded_channel();
        let (connected, _) = watch::channel(false);
        Self {
            url: format!(
                "{}/mutations?token={}",
                server_url.trim_end_matches('/'),
                urlencoding::encode(token)
            ),
            link: Mutex::new(None),
            waiters: Arc::new(Mutex::new(HashMap::new())),
            state_waiters: Arc::new(Mutex::new(Vec::new())),
            effects_tx,
            effects_rx: Mutex::new(Some(effects_rx)),
            connected: Arc::new(connected),
            rejected: Arc::new(Mutex::new(None)),
        }
    }

    /// Server pushes, in arrival order. Can only be taken once.
    pub fn take_effects(&self) -> Option<mpsc::UnboundedReceiver<ServerPush>> {
        self.effects_rx.lock().take()
    }

    /// Follows link liveness; flips to `false` when the socket closes.
    pub fn watch_connection(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Close code the server rejected the last connection with, if any.
    pub fn rejection(&self) -> Option<RejectReason> {
        *self.rejected.lock()
    }

    /// Open (or re-open) the socket.
    pub async fn connect(&self) -> Result<(), TransportError> {
        self.disconnect();
        *self.rejected.lock() = None;

        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();
        let (outgoing, mut out_rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let waiters = self.waiters.clone();
        let state_waiters = self.state_waiters.clone();
        let effects = self.effects_tx.clone();
        let connected = self.connected.clone();
        let rejected = self.rejected.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => match MutationFrame::decode(text.as_str()) {
                        Ok(MutationFrame::Response(response)) => {
                            if let Some(waiter) = waiters.lock().remove(&response.client_mutation_id) {
                                let _ = waiter.send(response);
                            }
                        }
                        Ok(MutationFrame::Effect(effect)) => {
                            let _ = effects.send(ServerPush::Effect(effect));
                        }
                        Ok(MutationFrame::State(state)) => {
                            let asked: Vec<_> = state_waiters.lock().drain(..).collect();
                            if asked.is_empty() {
                                let _ = effects.send(ServerPush::State(state));
                            } else {
                                for waiter in asked {
                                    let _ = waiter.send(state.clone());
                                }
                            }
                        }
                        Ok(MutationFrame::Request(_) | MutationFrame::Resync) => {
                            log::warn!("server sent a client frame; ignoring");
                        }
                        Err(e) => log::warn!("undecodable mutation frame: {}", e),
                    },
                    Ok(Message::Close(frame)) => {
                        if let Some(frame) = frame {
                            *rejected.lock() = RejectReason::from_close_code(u16::from(frame.code));
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::debug!("mutation socket error: {}", e);
                        break;
                    }
                }
            }
            connected.send_replace(false);
            // Dropping the senders fails every in-flight submit.
            waiters.lock().clear();
            state_waiters.lock().clear();
        });

        *self.link.lock() = Some(Link {
            outgoing,
            tasks: vec![writer, reader],
        });
        self.connected.send_replace(true);
        log::info!("mutation transport connected");
        Ok(())
    }

    pub fn disconnect(&self) {
        if let Some(link) = self.link.lock().take() {
            for task in link.tasks {
                task.abort();
            }
        }
        self.connected.send_replace(false);
        self.waiters.lock().clear();
        self.state_waiters.lock().clear();
    }

    fn send_text(&self, text: String) -> bool {
        match self.link.lock().as_ref() {
            Some(link) if self.is_connected() => link.outgoing.send(Message::text(text)).is_ok(),
            _ => false,
        }
    }

    fn failure(&self) -> TransportError {
        match self.rejection() {
            Some(reason) => TransportError::Rejected(reason),
            None => TransportError::Disconnected,
        }
    }
}

impl Drop for WsMutationTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[async_trait]
impl MutationTransport for WsMutationTransport {
    async fn submit(&self, request: MutationRequest) -> Result<MutationResponse, TransportError> {
        if let Some(reason) = self.rejection() {
            return Err(TransportError::Rejected(reason));
        }
        let text = MutationFrame::Request(request.clone())
            .encode()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(request.client_mutation_id, tx);
        if !self.send_text(text) {
            self.waiters.lock().remove(&request.client_mutation_id);
            return Err(TransportError::Disconnected);
        }
        rx.await.map_err(|_| self.failure())
    }

    async fn fetch_confirmed(&self) -> Result<ConfirmedState, TransportError> {
        if let Some(reason) = self.rejection() {
            return Err(TransportError::Rejected(reason));
        }
        let text = MutationFrame::Resync
            .encode()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        let (tx, rx) = oneshot::channel();
        self.state_waiters.lock().push(tx);
        if !self.send_text(text) {
            drop(rx);
            self.state_waiters.lock().retain(|w| !w.is_closed());
            return Err(TransportError::Disconnected);
        }
        rx.await.map_err(|_| self.failure())
    }
}
