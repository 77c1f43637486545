//! Client-side reactive cache: live queries over confirmed server state with
//! pending optimistic mutations replayed on top.
//!
//! ```text
//!  view = confirmed (version N) + landed (N+2, N+3 ...) + pending queue
//! ```
//!
//! `confirmed` only ever advances one authority version at a time. A commit
//! that arrives ahead of its predecessor waits in `landed`; if the missing
//! version does not show up within [`GAP_GRACE`], the cache fetches the
//! authority's whole state instead.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;

use super::mutators::MutatorRegistry;
use super::query::QuerySpec;
use super::queue::PendingQueue;
use super::record::{EntityStore, Record};
use super::transport::{MutationTransport, ServerPush, TransportError};
use super::{
    system_clock, Clock, ConfirmedState, Effect, MutationContext, MutationFailure, MutationId, MutationResponse,
    MutationStatus, PushedEffect, Side,
};

/// How long a version gap may stay open before the cache refetches.
pub const GAP_GRACE: Duration = Duration::from_millis(200);

type ServerResult = Result<Effect, MutationFailure>;

/// Result of [`SyncCache::mutate`]: the optimistic effect now, the server's
/// verdict later.
#[derive(Debug)]
pub struct MutationHandle {
    pub sequence: u64,
    pub client_mutation_id: MutationId,
    /// Effect of the optimistic local run, already visible in every query.
    pub local: Effect,
    server: oneshot::Receiver<ServerResult>,
}

impl MutationHandle {
    /// Wait for the server. `Err` carries the server's reason (e.g.
    /// `duplicate`); the optimistic effect has been reverted by then.
    pub async fn confirmed(self) -> ServerResult {
        self.server.await.unwrap_or_else(|_| {
            Err(MutationFailure {
                reason: "cache_closed".to_string(),
                message: None,
            })
        })
    }
}

struct QueryEntry {
    spec: QuerySpec,
    results: watch::Sender<Vec<Record>>,
    subscribers: usize,
}

#[derive(Default)]
struct CacheState {
    confirmed: EntityStore,
    /// Authority version `confirmed` reflects.
    confirmed_version: u64,
    /// Commits past a missing version, waiting for it.
    landed: BTreeMap<u64, Effect>,
    /// `confirmed` plus `landed` plus every pending mutation, in order.
    view: EntityStore,
    queue: PendingQueue,
    queries: HashMap<String, QueryEntry>,
    waiters: HashMap<u64, oneshot::Sender<ServerResult>>,
    closed: bool,
}

impl CacheState {
    fn land(&mut self, version: u64, effect: &Effect) {
        if version <= self.confirmed_version {
            return;
        }
        self.landed.entry(version).or_insert_with(|| effect.clone());
        self.drain_landed();
    }

    fn drain_landed(&mut self) {
        while let Some(effect) = self.landed.remove(&(self.confirmed_version + 1)) {
            self.confirmed.apply(&effect);
            self.confirmed_version += 1;
        }
    }

    fn has_gap(&self) -> bool {
        !self.landed.is_empty()
    }
}

struct Shared {
    client_id: String,
    registry: MutatorRegistry,
    clock: Clock,
    transport: Arc<dyn MutationTransport>,
    state: Mutex<CacheState>,
    wake: Notify,
    online: AtomicBool,
    gap_timer: AtomicBool,
}

impl Shared {
    fn context(&self, now_ms: u64) -> MutationContext {
        MutationContext {
            client_id: self.client_id.clone(),
            now_ms,
            side: Side::Client,
        }
    }

    /// Recompute the view from the confirmed store and the pending queue.
    /// A pending mutation that no longer applies locally contributes nothing
    /// until the server rules on it.
    fn rebuild_view(&self, state: &mut CacheState) {
        let mut view = state.confirmed.clone();
        for effect in state.landed.values() {
            view.apply(effect);
        }
        for entry in state.queue.iter() {
            let ctx = self.context(entry.issued_at_ms);
            match self.registry.execute(&entry.mutation_name, &view, &entry.args, &ctx) {
                Ok(effect) => view.apply(&effect),
                Err(e) => log::debug!(
                    "pending {}#{} no longer applies locally: {}",
                    entry.mutation_name,
                    entry.sequence,
                    e
                ),
            }
        }
        state.view = view;
        refresh_queries(state);
    }

    fn resolve(self: &Arc<Self>, response: MutationResponse) {
        let mut state = self.state.lock();
        if response.status == MutationStatus::Committed {
            match (response.version, &response.effect) {
                (Some(version), Some(effect)) => state.land(version, effect),
                (None, Some(effect)) => state.confirmed.apply(effect),
                _ => {}
            }
        }
        let seq = response.sequence_number;
        let matches = state
            .queue
            .get(seq)
            .is_some_and(|e| e.client_mutation_id == response.client_mutation_id);
        if matches {
            state.queue.resolve(seq);
        } else {
            log::debug!("response for unknown mutation #{}; already settled", seq);
        }
        self.rebuild_view(&mut state);
        if let Some(waiter) = matches.then(|| state.waiters.remove(&seq)).flatten() {
            let _ = waiter.send(response.into_result());
        }
        let gap = state.has_gap();
        drop(state);
        if gap {
            self.close_gap_later();
        }
    }

    /// Fold a pushed commit in. Our own commit settles its pending entry
    /// here if the push beat the response.
    fn ingest(self: &Arc<Self>, pushed: &PushedEffect) {
        let mut state = self.state.lock();
        state.land(pushed.version, &pushed.effect);
        let own = if pushed.client_id == self.client_id {
            state.queue.find(pushed.client_mutation_id)
        } else {
            None
        };
        if let Some(seq) = own {
            state.queue.resolve(seq);
        }
        self.rebuild_view(&mut state);
        if let Some(waiter) = own.and_then(|seq| state.waiters.remove(&seq)) {
            let _ = waiter.send(Ok(pushed.effect.clone()));
        }
        let gap = state.has_gap();
        drop(state);
        if gap {
            self.close_gap_later();
        }
    }

    /// Replace the confirmed store with the authority's. Older than what we
    /// already hold is ignored.
    fn install(self: &Arc<Self>, snapshot: ConfirmedState) {
        let mut state = self.state.lock();
        if snapshot.version < state.confirmed_version {
            log::debug!(
                "ignoring confirmed state v{} behind v{}",
                snapshot.version,
                state.confirmed_version
            );
            return;
        }
        state.confirmed = EntityStore::from_records(snapshot.records);
        state.confirmed_version = snapshot.version;
        state.landed = state.landed.split_off(&(snapshot.version + 1));
        state.drain_landed();
        self.rebuild_view(&mut state);
        let gap = state.has_gap();
        drop(state);
        log::debug!("{}: confirmed state reset to v{}", self.client_id, snapshot.version);
        if gap {
            self.close_gap_later();
        }
    }

    async fn refetch(self: &Arc<Self>) -> Result<(), TransportError> {
        let snapshot = self.transport.fetch_confirmed().await?;
        self.install(snapshot);
        Ok(())
    }

    /// Refetch unless the gap closes within [`GAP_GRACE`]. At most one timer
    /// runs at a time.
    fn close_gap_later(self: &Arc<Self>) {
        if self.gap_timer.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(GAP_GRACE).await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            shared.gap_timer.store(false, Ordering::SeqCst);
            if !shared.state.lock().has_gap() {
                return;
            }
            log::info!("{}: version gap persisted; fetching confirmed state", shared.client_id);
            if let Err(e) = shared.refetch().await {
                log::warn!("{}: confirmed state fetch failed: {}", shared.client_id, e);
            }
        });
    }
}

fn refresh_queries(state: &mut CacheState) {
    let CacheState { view, queries, .. } = state;
    for entry in queries.values() {
        let rows = entry.spec.evaluate(view);
        entry.results.send_if_modified(|current| {
            if *current == rows {
                return false;
            }
            *current = rows;
            true
        });
    }
}

/// Reactive cache for one client.
///
/// Requires a tokio runtime: construction spawns the dispatcher task that
/// submits pending mutations one at a time, in issue order. The cache starts
/// empty at version 0; call [`resync`](Self::resync) to load the authority's
/// current state.
pub struct SyncCache {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl SyncCache {
    pub fn new(client_id: impl Into<String>, registry: MutatorRegistry, transport: Arc<dyn MutationTransport>) -> Self {
        Self::with_clock(client_id, registry, transport, system_clock())
    }

    pub fn with_clock(
        client_id: impl Into<String>,
        registry: MutatorRegistry,
        transport: Arc<dyn MutationTransport>,
        clock: Clock,
    ) -> Self {
        let shared = Arc::new(Shared {
            client_id: client_id.into(),
            registry,
            clock,
            transport,
            state: Mutex::new(CacheState::default()),
            wake: Notify::new(),
            online: AtomicBool::new(true),
            gap_timer: AtomicBool::new(false),
        });
        let dispatcher = tokio::spawn(dispatch(shared.clone()));
        Self {
            shared,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    /// Replace the confirmed store wholesale, e.g. with an initial load.
    pub fn seed(&self, confirmed: EntityStore) {
        let mut state = self.shared.state.lock();
        state.confirmed = confirmed;
        self.shared.rebuild_view(&mut state);
    }

    /// Live view of `spec`. Equivalent specs share one computation, dropped
    /// with its last subscriber.
    pub fn subscribe(&self, spec: QuerySpec) -> LiveQuery {
        let key = spec.canonical_key();
        let mut state = self.shared.state.lock();
        let CacheState { view, queries, .. } = &mut *state;
        let entry = queries.entry(key.clone()).or_insert_with(|| {
            let (results, _) = watch::channel(spec.evaluate(view));
            QueryEntry {
                spec,
                results,
                subscribers: 0,
            }
        });
        entry.subscribers += 1;
        LiveQuery {
            key,
            rows: entry.results.subscribe(),
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Run `name` optimistically and queue it for the server.
    ///
    /// A mutation that fails locally is never sent.
    pub fn mutate(&self, name: &str, args: Value) -> Result<MutationHandle, MutationFailure> {
        let now_ms = (self.shared.clock)();
        let ctx = self.shared.context(now_ms);
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(MutationFailure {
                reason: "cache_closed".to_string(),
                message: None,
            });
        }

        let local = self.shared.registry.execute(name, &state.view, &args, &ctx)?;
        state.view.apply(&local);
        let entry = state.queue.push(name, args, now_ms);
        let (sequence, client_mutation_id) = (entry.sequence, entry.client_mutation_id);
        let (tx, server) = oneshot::channel();
        state.waiters.insert(sequence, tx);
        refresh_queries(&mut state);
        drop(state);

        log::debug!("queued {} as #{}", name, sequence);
        self.shared.wake.notify_one();
        Ok(MutationHandle {
            sequence,
            client_mutation_id,
            local,
            server,
        })
    }

    /// Fold a committed effect into the confirmed store at its version.
    pub fn ingest(&self, pushed: &PushedEffect) {
        self.shared.ingest(pushed);
    }

    /// Replace the confirmed store with a state the server sent.
    pub fn install(&self, state: ConfirmedState) {
        self.shared.install(state);
    }

    pub fn apply_push(&self, push: ServerPush) {
        match push {
            ServerPush::Effect(effect) => self.shared.ingest(&effect),
            ServerPush::State(state) => self.shared.install(state),
        }
    }

    /// Load the authority's current store and version.
    pub async fn resync(&self) -> Result<(), TransportError> {
        self.shared.refetch().await
    }

    /// The link is back: resend every pending mutation in original order and
    /// refetch whatever was committed while it was down.
    pub fn reconnect(&self) {
        let requeued = self.shared.state.lock().queue.requeue_all();
        self.shared.online.store(true, Ordering::SeqCst);
        log::info!("mutation link restored; {} in flight will be resent", requeued);
        self.shared.wake.notify_one();

        let shared = self.shared.clone();
        tokio::spawn(async move {
            if let Err(e) = shared.refetch().await {
                log::warn!("{}: confirmed state fetch after reconnect failed: {}", shared.client_id, e);
            }
        });
    }

    /// `false` after a transport failure until [`reconnect`](Self::reconnect).
    pub fn is_online(&self) -> bool {
        self.shared.online.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Sequence numbers still awaiting the server, in resend order.
    pub fn pending_sequences(&self) -> Vec<u64> {
        self.shared.state.lock().queue.replay_plan()
    }

    /// Distinct live query computations.
    pub fn query_count(&self) -> usize {
        self.shared.state.lock().queries.len()
    }

    pub fn view(&self) -> EntityStore {
        self.shared.state.lock().view.clone()
    }

    pub fn confirmed(&self) -> EntityStore {
        self.shared.state.lock().confirmed.clone()
    }

    /// Authority version of [`confirmed`](Self::confirmed).
    pub fn confirmed_version(&self) -> u64 {
        self.shared.state.lock().confirmed_version
    }

    /// Stop dispatching. Waiting handles resolve with `cache_closed`.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            state.closed = true;
            state.waiters.clear();
        }
        if let Some(task) = self.dispatcher.lock().take() {
            task.abort();
        }
    }
}

impl Drop for SyncCache {
    fn drop(&mut self) {
        self.close();
    }
}

async fn dispatch(shared: Arc<Shared>) {
    loop {
        let request = {
            let mut state = shared.state.lock();
            if state.closed {
                return;
            }
            let next = state.queue.next_to_send().map(|e| e.sequence);
            match next {
                Some(seq) if shared.online.load(Ordering::SeqCst) => {
                    state.queue.mark_in_flight(seq);
                    state.queue.request(seq, &shared.client_id)
                }
                _ => None,
            }
        };
        let Some(request) = request else {
            shared.wake.notified().await;
            continue;
        };

        let seq = request.sequence_number;
        match shared.transport.submit(request).await {
            Ok(response) => shared.resolve(response),
            Err(e) => {
                log::warn!("mutation #{} not delivered ({}); waiting for reconnect", seq, e);
                shared.online.store(false, Ordering::SeqCst);
                shared.state.lock().queue.requeue_all();
            }
        }
    }
}

/// A subscription to one query's results.
pub struct LiveQuery {
    key: String,
    rows: watch::Receiver<Vec<Record>>,
    shared: Weak<Shared>,
}

impl LiveQuery {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current rows.
    pub fn current(&self) -> Vec<Record> {
        self.rows.borrow().clone()
    }

    /// Wait for the next change. `None` once the cache is gone.
    pub async fn changed(&mut self) -> Option<Vec<Record>> {
        self.rows.changed().await.ok()?;
        Some(self.rows.borrow_and_update().clone())
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut state = shared.state.lock();
        let last = match state.queries.get_mut(&self.key) {
            Some(entry) => {
                entry.subscribers = entry.subscribers.saturating_sub(1);
                entry.subscribers == 0
            }
            None => false,
        };
        if last {
            state.queries.remove(&self.key);
        }
    }
}
