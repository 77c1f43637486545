//! Server-side mutation executor.
//!
//! Runs each client's mutations exactly once, in that client's issue order:
//! early sequence numbers wait until the gap before them is filled, and
//! resends of an already-executed mutation get the stored response back.
//! A client is a `(client_id, epoch)` pair, so a restarted cache reusing its
//! id starts over at sequence 1.
//!
//! Every commit bumps the authority version. Responses and pushed effects
//! carry it so caches can apply commits in the order they happened.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

use super::mutators::MutatorRegistry;
use super::query::QuerySpec;
use super::record::{EntityStore, Record};
use super::{
    system_clock, Clock, ConfirmedState, MutationContext, MutationRequest, MutationResponse, PushedEffect, Side,
};

const EFFECT_CHANNEL_CAPACITY: usize = 1024;

/// How long an idle client's progress is kept.
const DEFAULT_CLIENT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Admissions between sweeps for idle clients.
const PRUNE_EVERY: u64 = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    client_id: String,
    epoch: Uuid,
}

struct Parked {
    request: MutationRequest,
    reply: oneshot::Sender<MutationResponse>,
}

struct ClientProgress {
    next_sequence: u64,
    /// Final responses not yet acknowledged by the client.
    responses: BTreeMap<u64, MutationResponse>,
    parked: BTreeMap<u64, Parked>,
    last_seen_ms: u64,
}

impl ClientProgress {
    fn starting_at(next_sequence: u64, now_ms: u64) -> Self {
        Self {
            next_sequence,
            responses: BTreeMap::new(),
            parked: BTreeMap::new(),
            last_seen_ms: now_ms,
        }
    }
}

#[derive(Default)]
struct AuthorityState {
    store: EntityStore,
    clients: HashMap<ClientKey, ClientProgress>,
    /// Commits so far; the version of `store`.
    version: u64,
    admissions: u64,
}

enum Admission {
    Ready(MutationResponse),
    Parked(oneshot::Receiver<MutationResponse>),
}

pub struct MutationAuthority {
    registry: MutatorRegistry,
    clock: Clock,
    client_ttl: Duration,
    state: Mutex<AuthorityState>,
    effects: broadcast::Sender<PushedEffect>,
}

impl std::fmt::Debug for MutationAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationAuthority")
            .field("registry", &self.registry)
            .field("version", &self.version())
            .finish()
    }
}

impl MutationAuthority {
    pub fn new(registry: MutatorRegistry) -> Self {
        Self::with_clock(registry, system_clock())
    }

    pub fn with_clock(registry: MutatorRegistry, clock: Clock) -> Self {
        Self::with_effect_capacity(registry, clock, EFFECT_CHANNEL_CAPACITY)
    }

    /// Pushed effects buffered per subscriber before slow ones start missing
    /// them.
    pub fn with_effect_capacity(registry: MutatorRegistry, clock: Clock, capacity: usize) -> Self {
        let (effects, _) = broadcast::channel(capacity.max(1));
        Self {
            registry,
            clock,
            client_ttl: DEFAULT_CLIENT_TTL,
            state: Mutex::new(AuthorityState::default()),
            effects,
        }
    }

    /// Forget a client's progress once it has been idle this long with
    /// nothing parked. A resend older than that is treated as a new client.
    pub fn with_client_ttl(mut self, ttl: Duration) -> Self {
        self.client_ttl = ttl;
        self
    }

    /// Replace the canonical store, e.g. with rows loaded at startup.
    pub fn load(&self, store: EntityStore) {
        self.state.lock().store = store;
    }

    /// Committed effects, for pushing to clients.
    pub fn subscribe(&self) -> broadcast::Receiver<PushedEffect> {
        self.effects.subscribe()
    }

    pub fn store(&self) -> EntityStore {
        self.state.lock().store.clone()
    }

    /// The store and the version it reflects, read atomically.
    pub fn confirmed_state(&self) -> ConfirmedState {
        let state = self.state.lock();
        ConfirmedState {
            version: state.version,
            records: state.store.iter().cloned().collect(),
        }
    }

    pub fn query(&self, spec: &QuerySpec) -> Vec<Record> {
        spec.evaluate(&self.state.lock().store)
    }

    /// Version of the latest commit.
    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    pub fn committed_count(&self) -> u64 {
        self.version()
    }

    /// Requests waiting for an earlier sequence number from `client_id`.
    pub fn parked_count(&self, client_id: &str) -> usize {
        self.state
            .lock()
            .clients
            .iter()
            .filter(|(key, _)| key.client_id == client_id)
            .map(|(_, p)| p.parked.len())
            .sum()
    }

    /// `(client_id, epoch)` pairs with progress on record.
    pub fn tracked_clients(&self) -> usize {
        self.state.lock().clients.len()
    }

    /// Drop progress of clients idle past the TTL. Also runs on its own
    /// every few hundred admissions.
    pub fn prune_idle(&self) -> usize {
        let now_ms = (self.clock)();
        let mut state = self.state.lock();
        self.prune(&mut state.clients, now_ms)
    }

    fn prune(&self, clients: &mut HashMap<ClientKey, ClientProgress>, now_ms: u64) -> usize {
        let ttl_ms = self.client_ttl.as_millis() as u64;
        let before = clients.len();
        clients.retain(|_, p| !p.parked.is_empty() || now_ms.saturating_sub(p.last_seen_ms) < ttl_ms);
        let pruned = before - clients.len();
        if pruned > 0 {
            log::debug!("forgot {} idle mutation clients", pruned);
        }
        pruned
    }

    /// Execute (or answer a resend of) one request.
    pub async fn submit(&self, request: MutationRequest) -> MutationResponse {
        let fallback = MutationResponse::rejected(&request, "superseded");
        let waiter = match self.admit(request) {
            Admission::Ready(response) => return response,
            Admission::Parked(waiter) => waiter,
        };
        // The sender is dropped only when a resend of the same sequence
        // number replaced this request.
        waiter.await.unwrap_or(fallback)
    }

    fn admit(&self, request: MutationRequest) -> Admission {
        let now_ms = (self.clock)();
        let mut guard = self.state.lock();
        let AuthorityState {
            store,
            clients,
            version,
            admissions,
        } = &mut *guard;

        *admissions += 1;
        if *admissions % PRUNE_EVERY == 0 {
            self.prune(clients, now_ms);
        }

        let ack = request.acknowledged_through;
        let key = ClientKey {
            client_id: request.client_id.clone(),
            epoch: request.epoch,
        };
        let progress = clients
            .entry(key)
            .or_insert_with(|| ClientProgress::starting_at(ack + 1, now_ms));
        progress.last_seen_ms = now_ms;
        progress.responses = progress.responses.split_off(&(ack + 1));

        let seq = request.sequence_number;
        if seq < progress.next_sequence {
            return match progress.responses.get(&seq) {
                Some(stored) if stored.client_mutation_id == request.client_mutation_id => {
                    log::debug!("mutation {}#{} resent; answering from record", request.client_id, seq);
                    Admission::Ready(stored.clone())
                }
                _ => {
                    log::warn!("mutation {}#{} is behind the client's sequence", request.client_id, seq);
                    Admission::Ready(MutationResponse::rejected(&request, "stale_sequence"))
                }
            };
        }

        if seq > progress.next_sequence {
            log::debug!(
                "mutation {}#{} parked waiting for #{}",
                request.client_id,
                seq,
                progress.next_sequence
            );
            let (reply, waiter) = oneshot::channel();
            progress.parked.insert(seq, Parked { request, reply });
            return Admission::Parked(waiter);
        }

        let response = self.execute(store, version, &request);
        progress.responses.insert(seq, response.clone());
        progress.next_sequence += 1;

        while let Some(parked) = progress.parked.remove(&progress.next_sequence) {
            let released = self.execute(store, version, &parked.request);
            progress.responses.insert(progress.next_sequence, released.clone());
            progress.next_sequence += 1;
            let _ = parked.reply.send(released);
        }

        Admission::Ready(response)
    }

    fn execute(&self, store: &mut EntityStore, version: &mut u64, request: &MutationRequest) -> MutationResponse {
        let ctx = MutationContext {
            client_id: request.client_id.clone(),
            now_ms: (self.clock)(),
            side: Side::Server,
        };
        match self.registry.execute(&request.mutation_name, store, &request.args, &ctx) {
            Ok(effect) => {
                store.apply(&effect);
                *version += 1;
                log::debug!(
                    "committed {} for {}#{} as v{}",
                    request.mutation_name,
                    request.client_id,
                    request.sequence_number,
                    version
                );
                let _ = self.effects.send(PushedEffect {
                    client_id: request.client_id.clone(),
                    client_mutation_id: request.client_mutation_id,
                    version: *version,
                    effect: effect.clone(),
                });
                MutationResponse::committed(request, *version, effect)
            }
            Err(e) => {
                log::debug!(
                    "rejected {} for {}#{}: {}",
                    request.mutation_name,
                    request.client_id,
                    request.sequence_number,
                    e
                );
                MutationResponse::rejected(request, e.reason())
            }
        }
    }
}
