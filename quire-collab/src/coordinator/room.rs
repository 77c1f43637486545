//! Document rooms: one task per open document owning its replica.
//!
//! ```text
//! session ─┐ RoomCommand           ┌─► BroadcastGroup ─► other sessions
//! session ─┼─────────────► Room ───┤
//! session ─┘   (mpsc)      │       └─► Outbound (direct replies)
//!                          ▼
//!                  PersistenceWriter ─► SnapshotStore
//! ```
//!
//! Merges are synchronous inside the room; the only awaits are on the
//! command channel and timers, so a slow client or a slow disk never stalls
//! the other members.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

use super::persistence::{Alert, PersistenceWriter, WriterDeps};
use super::session::CLOSE_GOING_AWAY;
use super::stats::StatsCounters;
use super::Shared;
use crate::auth::Identity;
use crate::awareness::{Awareness, AwarenessUpdate, ClientId};
use crate::broadcast::{BroadcastGroup, ConnectionId, Frame, LagReporter};
use crate::crdt::{OperationBatch, Replica, ReplicaId, RichTextDocument, StateVector};
use crate::protocol::{DocumentId, RejectReason, SyncMessage};
use crate::storage::{StoreError, StoredDocument};

/// Replica id of the coordinator's copy. It never authors edits.
pub const SERVER_REPLICA: ReplicaId = 0;

/// Something a room sends to exactly one connection.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outbound {
    Frame(Vec<u8>),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone)]
pub(crate) struct JoinRequest {
    pub connection: ConnectionId,
    pub identity: Identity,
    pub token: String,
    pub outbox: mpsc::UnboundedSender<Outbound>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JoinError {
    Rejected(RejectReason),
    /// Storage could not produce the document.
    Unavailable,
    /// The room was shutting down; retry against a fresh one.
    Closed,
}

pub(crate) struct Joined {
    pub room: RoomHandle,
    pub frames: broadcast::Receiver<Arc<Frame>>,
    pub lag: LagReporter,
}

pub(crate) enum RoomCommand {
    Join {
        request: JoinRequest,
        reply: oneshot::Sender<Result<Joined, JoinError>>,
    },
    Update {
        connection: ConnectionId,
        batch: OperationBatch,
        /// Encoded `Update` frame to relay unchanged.
        frame: Vec<u8>,
    },
    SyncStep1 {
        connection: ConnectionId,
        state_vector: StateVector,
    },
    Awareness {
        connection: ConnectionId,
        update: AwarenessUpdate,
        frame: Vec<u8>,
    },
    /// The connection missed broadcast frames; send it the full state.
    Resync {
        connection: ConnectionId,
    },
    Leave {
        connection: ConnectionId,
    },
    Revoked {
        connections: Vec<(ConnectionId, RejectReason)>,
    },
    Delete,
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub(crate) struct RoomHandle {
    generation: u64,
    commands: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    /// `false` once the room has stopped taking commands.
    pub fn send(&self, command: RoomCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    fn is_open(&self) -> bool {
        !self.commands.is_closed()
    }
}

/// Open rooms by document, plus the writers of rooms that are closing.
#[derive(Default)]
pub(crate) struct RoomRegistry {
    rooms: Mutex<HashMap<DocumentId, RoomHandle>>,
    /// A room for the same document must not load before these finish.
    retiring: Mutex<HashMap<DocumentId, watch::Receiver<bool>>>,
    next_generation: AtomicU64,
}

impl RoomRegistry {
    pub fn get(&self, document: DocumentId) -> Option<RoomHandle> {
        self.rooms.lock().get(&document).filter(|h| h.is_open()).cloned()
    }

    pub fn documents(&self) -> Vec<DocumentId> {
        let mut docs: Vec<DocumentId> = self.rooms.lock().keys().copied().collect();
        docs.sort();
        docs
    }

    pub fn handles(&self) -> Vec<RoomHandle> {
        self.rooms.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rooms.lock().len()
    }

    /// The live room for `document`, spawning one if needed.
    pub fn get_or_spawn(&self, shared: &Arc<Shared>, document: DocumentId) -> RoomHandle {
        let mut rooms = self.rooms.lock();
        if let Some(handle) = rooms.get(&document).filter(|h| h.is_open()) {
            return handle.clone();
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (commands, rx) = mpsc::unbounded_channel();
        let handle = RoomHandle { generation, commands };
        let previous = self.retiring.lock().remove(&document);
        rooms.insert(document, handle.clone());
        StatsCounters::incr(&shared.stats.active_rooms);
        tokio::spawn(run_room(shared.clone(), document, handle.clone(), rx, previous));
        log::debug!("room {document} (generation {generation}) spawned");
        handle
    }

    /// Deregister a room if it is still the registered generation.
    fn retire(&self, document: DocumentId, generation: u64, finished: Option<watch::Receiver<bool>>) {
        let mut rooms = self.rooms.lock();
        if rooms.get(&document).is_some_and(|h| h.generation == generation) {
            rooms.remove(&document);
        }
        if let Some(finished) = finished {
            self.retiring.lock().insert(document, finished);
        }
    }
}

struct Member {
    identity: Identity,
    token: String,
    outbox: mpsc::UnboundedSender<Outbound>,
    awareness_clients: HashSet<ClientId>,
}

impl Member {
    fn send(&self, frame: Vec<u8>) {
        let _ = self.outbox.send(Outbound::Frame(frame));
    }

    fn close(&self, code: u16, reason: &str) {
        let _ = self.outbox.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

/// Why a room stopped.
enum Exit {
    /// Last member left.
    Empty,
    Deleted,
    Shutdown(oneshot::Sender<()>),
}

enum LoadFailure {
    Deleted,
    Unavailable,
}

struct Room {
    document: DocumentId,
    handle: RoomHandle,
    shared: Arc<Shared>,
    replica: RichTextDocument,
    group: BroadcastGroup,
    awareness: Awareness,
    members: HashMap<ConnectionId, Member>,
    writer: PersistenceWriter,
    unflushed: Vec<OperationBatch>,
    flush_deadline: Option<Instant>,
    flushes: u64,
    dirty_since_snapshot: bool,
    reauthorizing: Arc<std::sync::atomic::AtomicBool>,
}

async fn run_room(
    shared: Arc<Shared>,
    document: DocumentId,
    handle: RoomHandle,
    mut commands: mpsc::UnboundedReceiver<RoomCommand>,
    previous: Option<watch::Receiver<bool>>,
) {
    if let Some(mut previous) = previous {
        let _ = previous.wait_for(|done| *done).await;
    }

    match load_replica(&shared, document).await {
        Ok(replica) => {
            let writer = PersistenceWriter::spawn(
                document,
                WriterDeps {
                    store: shared.store.clone(),
                    policy: shared.config.persistence_backoff.clone(),
                    alerts: shared.alerts.clone(),
                    stats: shared.stats.clone(),
                },
            );
            let room = Room {
                document,
                handle,
                group: BroadcastGroup::new(shared.config.broadcast_capacity),
                awareness: Awareness::with_timeout(SERVER_REPLICA, shared.config.awareness_timeout),
                shared,
                replica,
                members: HashMap::new(),
                writer,
                unflushed: Vec::new(),
                flush_deadline: None,
                flushes: 0,
                dirty_since_snapshot: false,
                reauthorizing: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            };
            room.serve(commands).await;
        }
        Err(failure) => {
            let error = match failure {
                LoadFailure::Deleted => JoinError::Rejected(RejectReason::DocumentDeleted),
                LoadFailure::Unavailable => JoinError::Unavailable,
            };
            shared.rooms.retire(document, handle.generation, None);
            drain(&mut commands, error).await;
            StatsCounters::decr(&shared.stats.active_rooms);
        }
    }
}

/// Answer whatever is still queued once a room has stopped.
async fn drain(commands: &mut mpsc::UnboundedReceiver<RoomCommand>, join_error: JoinError) {
    commands.close();
    while let Some(command) = commands.recv().await {
        match command {
            RoomCommand::Join { reply, .. } => {
                let _ = reply.send(Err(join_error));
            }
            RoomCommand::Shutdown { done } => {
                let _ = done.send(());
            }
            _ => {}
        }
    }
}

async fn load_replica(shared: &Arc<Shared>, document: DocumentId) -> Result<RichTextDocument, LoadFailure> {
    let policy = &shared.config.persistence_backoff;
    let mut attempt = 0;
    let stored = loop {
        let store = shared.store.clone();
        let result = tokio::task::spawn_blocking(move || store.load(document))
            .await
            .unwrap_or_else(|e| Err(StoreError::Unavailable(format!("load task failed: {e}"))));
        match result {
            Ok(stored) => break stored,
            Err(StoreError::Tombstoned(_)) => return Err(LoadFailure::Deleted),
            Err(e) if policy.allows(attempt) => {
                log::warn!("loading {document} failed (attempt {}): {e}", attempt + 1);
                tokio::time::sleep(policy.delay(attempt)).await;
                attempt += 1;
            }
            Err(error) => {
                shared.alerts.alert(Alert {
                    document,
                    operation: "load",
                    attempts: attempt + 1,
                    error,
                });
                return Err(LoadFailure::Unavailable);
            }
        }
    };

    let mut replica = RichTextDocument::new(SERVER_REPLICA);
    let Some(StoredDocument { snapshot, updates }) = stored else {
        log::info!("document {document} is new");
        return Ok(replica);
    };
    if let Some(snapshot) = snapshot {
        if let Err(error) = replica.load_snapshot(&snapshot) {
            shared.alerts.alert(Alert {
                document,
                operation: "load_snapshot",
                attempts: 1,
                error: StoreError::Deserialization(error.to_string()),
            });
            return Err(LoadFailure::Unavailable);
        }
    }
    let mut replayed = 0;
    for (seq, update) in updates.iter().enumerate() {
        match replica.apply_encoded_batch(update) {
            Ok(_) => replayed += 1,
            Err(e) => log::warn!("document {document}: skipping stored update {seq}: {e}"),
        }
    }
    log::info!(
        "document {document} loaded: {} chars, {replayed} updates replayed",
        replica.len()
    );
    Ok(replica)
}

impl Room {
    async fn serve(mut self, mut commands: mpsc::UnboundedReceiver<RoomCommand>) {
        let mut housekeeping = tokio::time::interval(self.shared.config.heartbeat_interval);
        housekeeping.tick().await;

        let exit = loop {
            let deadline = self.flush_deadline;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if let Some(exit) = self.handle(command) {
                            break exit;
                        }
                    }
                    None => break Exit::Empty,
                },
                _ = sleep_until_opt(deadline), if deadline.is_some() => self.flush(false),
                _ = housekeeping.tick() => {
                    if let Some(exit) = self.housekeeping() {
                        break exit;
                    }
                }
            }
        };
        self.retire(exit, commands).await;
    }

    fn handle(&mut self, command: RoomCommand) -> Option<Exit> {
        match command {
            RoomCommand::Join { request, reply } => self.join(request, reply),
            RoomCommand::Update {
                connection,
                batch,
                frame,
            } => self.update(connection, batch, frame),
            RoomCommand::SyncStep1 {
                connection,
                state_vector,
            } => {
                let diff = self.replica.diff_since(&state_vector);
                self.send_batch(connection, &diff);
            }
            RoomCommand::Awareness {
                connection,
                update,
                frame,
            } => self.awareness(connection, update, frame),
            RoomCommand::Resync { connection } => self.send_full_state(connection),
            RoomCommand::Leave { connection } => {
                self.leave(connection);
                if self.members.is_empty() {
                    return Some(Exit::Empty);
                }
            }
            RoomCommand::Revoked { connections } => {
                for (connection, reason) in connections {
                    if let Some(member) = self.members.get(&connection) {
                        log::info!(
                            "document {}: revoking {} ({})",
                            self.document,
                            member.identity.user_id,
                            reason
                        );
                        member.close(reason.close_code(), reason.description());
                    }
                    self.leave(connection);
                }
                if self.members.is_empty() {
                    return Some(Exit::Empty);
                }
            }
            RoomCommand::Delete => return Some(Exit::Deleted),
            RoomCommand::Shutdown { done } => return Some(Exit::Shutdown(done)),
        }
        None
    }

    fn join(&mut self, request: JoinRequest, reply: oneshot::Sender<Result<Joined, JoinError>>) {
        let connection = request.connection;
        let frames = self.group.add_member(connection, request.identity.user_id.clone());
        let member = Member {
            identity: request.identity,
            token: request.token,
            outbox: request.outbox,
            awareness_clients: HashSet::new(),
        };
        self.members.insert(connection, member);
        self.send_full_state(connection);
        for state in self.awareness.states() {
            match SyncMessage::awareness(self.document, &AwarenessUpdate::Update(state)).and_then(|m| m.encode()) {
                Ok(frame) => self.send_to(connection, frame),
                Err(e) => log::warn!("document {}: awareness encode failed: {e}", self.document),
            }
        }

        let joined = Joined {
            room: self.handle.clone(),
            frames,
            lag: self.group.lag_reporter(),
        };
        if reply.send(Ok(joined)).is_err() {
            self.leave(connection);
            return;
        }
        log::info!(
            "document {}: {} joined ({} members)",
            self.document,
            self.members.get(&connection).map_or("?", |m| m.identity.user_id.as_str()),
            self.members.len()
        );
    }

    /// Full state as `SyncStep2`, then our state vector as `SyncStep1`.
    fn send_full_state(&self, connection: ConnectionId) {
        let full = self.replica.diff_since(&StateVector::new());
        self.send_batch(connection, &full);
        match SyncMessage::sync_step1(self.document, &self.replica.state_vector()).and_then(|m| m.encode()) {
            Ok(frame) => self.send_to(connection, frame),
            Err(e) => log::warn!("document {}: state vector encode failed: {e}", self.document),
        }
    }

    fn send_batch(&self, connection: ConnectionId, batch: &OperationBatch) {
        match SyncMessage::sync_step2(self.document, batch).and_then(|m| m.encode()) {
            Ok(frame) => self.send_to(connection, frame),
            Err(e) => log::warn!("document {}: diff encode failed: {e}", self.document),
        }
    }

    fn send_to(&self, connection: ConnectionId, frame: Vec<u8>) {
        if let Some(member) = self.members.get(&connection) {
            member.send(frame);
        }
    }

    fn update(&mut self, connection: ConnectionId, batch: OperationBatch, frame: Vec<u8>) {
        if !self.members.contains_key(&connection) {
            return;
        }
        match self.replica.apply_remote_batch(&batch) {
            Ok(outcome) if outcome.changed() || outcome.buffered > 0 => {
                self.group.broadcast_raw(frame, Some(connection));
                StatsCounters::incr(&self.shared.stats.relayed_updates);
                self.unflushed.push(batch);
                self.dirty_since_snapshot = true;
                self.flush_deadline = Some(Instant::now() + self.shared.config.flush_debounce);
            }
            Ok(_) => log::trace!("document {}: duplicate batch from {connection}", self.document),
            Err(e) => {
                StatsCounters::incr(&self.shared.stats.dropped_batches);
                log::warn!("document {}: dropped batch from {connection}: {e}", self.document);
            }
        }
    }

    fn awareness(&mut self, connection: ConnectionId, update: AwarenessUpdate, frame: Vec<u8>) {
        let Some(member) = self.members.get_mut(&connection) else {
            return;
        };
        let client = update.client_id();
        if !member.awareness_clients.contains(&client) {
            self.awareness.forget_removed(client);
        }
        if !self.awareness.apply_update(&update) {
            return;
        }
        match update {
            AwarenessUpdate::Update(_) => {
                member.awareness_clients.insert(client);
            }
            AwarenessUpdate::Remove { .. } => {
                member.awareness_clients.remove(&client);
            }
        }
        self.group.broadcast_raw(frame, Some(connection));
    }

    fn broadcast_awareness(&self, update: &AwarenessUpdate) {
        match SyncMessage::awareness(self.document, update).and_then(|m| m.encode()) {
            Ok(frame) => {
                self.group.broadcast_raw(frame, None);
            }
            Err(e) => log::warn!("document {}: awareness encode failed: {e}", self.document),
        }
    }

    fn leave(&mut self, connection: ConnectionId) {
        let Some(member) = self.members.remove(&connection) else {
            return;
        };
        self.group.remove_member(connection);
        for client in member.awareness_clients {
            if let Some(removal) = self.awareness.remove_client(client) {
                self.broadcast_awareness(&removal);
            }
        }
        log::info!(
            "document {}: {} left ({} members)",
            self.document,
            member.identity.user_id,
            self.members.len()
        );
    }

    fn housekeeping(&mut self) -> Option<Exit> {
        for removal in self.awareness.remove_stale() {
            let client = removal.client_id();
            for member in self.members.values_mut() {
                member.awareness_clients.remove(&client);
            }
            self.broadcast_awareness(&removal);
        }

        let gone: Vec<ConnectionId> = self
            .members
            .iter()
            .filter(|(_, m)| m.outbox.is_closed())
            .map(|(id, _)| *id)
            .collect();
        for connection in gone {
            self.leave(connection);
        }

        if self.writer.needs_snapshot() && self.flush_deadline.is_none() {
            self.flush_deadline = Some(Instant::now());
        }
        if self.members.is_empty() {
            return Some(Exit::Empty);
        }
        None
    }

    /// Hand accumulated updates (or a snapshot) to the writer.
    fn flush(&mut self, final_flush: bool) {
        self.flush_deadline = None;
        let batches = std::mem::take(&mut self.unflushed);
        if !batches.is_empty() {
            self.flushes += 1;
        }

        let every = self.shared.config.snapshot_every_flushes.max(1);
        let snapshot_due = self.writer.needs_snapshot()
            || (final_flush && self.dirty_since_snapshot)
            || (!batches.is_empty() && self.flushes % every == 0);

        if snapshot_due {
            match self.replica.snapshot() {
                Ok(bytes) => {
                    log::debug!("document {}: snapshot ({} bytes)", self.document, bytes.len());
                    self.writer.snapshot(bytes);
                    self.dirty_since_snapshot = false;
                }
                Err(e) => log::error!("document {}: snapshot failed: {e}", self.document),
            }
        } else if !batches.is_empty() {
            match merge_batches(batches).encode() {
                Ok(bytes) => self.writer.append(bytes),
                Err(e) => log::error!("document {}: update encode failed: {e}", self.document),
            }
        }

        if !final_flush {
            self.reauthorize();
        }
    }

    /// Re-check every member's token off the room task; failures come back
    /// as `Revoked`.
    fn reauthorize(&self) {
        if self.members.is_empty() || self.reauthorizing.swap(true, Ordering::SeqCst) {
            return;
        }
        let checks: Vec<(ConnectionId, String)> = self
            .members
            .iter()
            .map(|(id, m)| (*id, m.token.clone()))
            .collect();
        let authorizer = self.shared.authorizer.clone();
        let commands = self.handle.commands.downgrade();
        let running = self.reauthorizing.clone();
        let document = self.document;
        tokio::spawn(async move {
            let mut revoked = Vec::new();
            for (connection, token) in checks {
                if let crate::auth::AuthDecision::Deny(failure) = authorizer.authorize(&token, Some(document)).await {
                    revoked.push((connection, failure.reject_reason()));
                }
            }
            running.store(false, Ordering::SeqCst);
            if revoked.is_empty() {
                return;
            }
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(RoomCommand::Revoked { connections: revoked });
            }
        });
    }

    async fn retire(mut self, exit: Exit, mut commands: mpsc::UnboundedReceiver<RoomCommand>) {
        let document = self.document;
        let join_error = match &exit {
            Exit::Deleted => {
                for member in self.members.values() {
                    member.close(
                        RejectReason::DocumentDeleted.close_code(),
                        RejectReason::DocumentDeleted.description(),
                    );
                }
                log::info!("document {document} deleted; room closed");
                JoinError::Rejected(RejectReason::DocumentDeleted)
            }
            Exit::Empty | Exit::Shutdown(_) => {
                self.flush(true);
                for member in self.members.values() {
                    member.close(CLOSE_GOING_AWAY, "server shutting down");
                }
                log::info!("document {document}: room closed");
                JoinError::Closed
            }
        };

        let Room {
            shared,
            handle,
            writer,
            ..
        } = self;
        shared.rooms.retire(document, handle.generation, Some(writer.finished()));
        drop(handle);
        drop(writer);
        if let Exit::Shutdown(done) = exit {
            let _ = done.send(());
        }
        drain(&mut commands, join_error).await;
        StatsCounters::decr(&shared.stats.active_rooms);
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Concatenate batches into one log entry. Replaying it is equivalent to
/// replaying each in turn.
fn merge_batches(batches: Vec<OperationBatch>) -> OperationBatch {
    let mut merged = OperationBatch {
        origin: SERVER_REPLICA,
        clock: 0,
        ops: Vec::new(),
        deletes: Vec::new(),
    };
    let mut seen = HashSet::new();
    for batch in batches {
        merged.clock = merged.clock.max(batch.clock);
        merged.ops.extend(batch.ops);
        merged
            .deletes
            .extend(batch.deletes.into_iter().filter(|id| seen.insert(*id)));
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::Edit;

    #[test]
    fn test_merged_batches_replay_like_originals() {
        let mut alice = RichTextDocument::new(1);
        let mut bob = RichTextDocument::new(2);
        let a1 = alice
            .apply_local_edit(Edit::Insert { index: 0, text: "Hello".into() })
            .unwrap();
        bob.apply_remote_batch(&a1).unwrap();
        let b1 = bob
            .apply_local_edit(Edit::Insert { index: 5, text: " world".into() })
            .unwrap();
        let b2 = bob.apply_local_edit(Edit::Delete { index: 0, len: 1 }).unwrap();
        let a2 = alice.apply_local_edit(Edit::Delete { index: 0, len: 1 }).unwrap();

        let merged = merge_batches(vec![a1, b1, b2, a2]);
        assert_eq!(merged.deletes.len(), 1);

        let mut replayed = RichTextDocument::new(SERVER_REPLICA);
        replayed.apply_encoded_batch(&merged.encode().unwrap()).unwrap();
        assert_eq!(replayed.text(), "ello world");
        assert_eq!(replayed.state_vector(), bob.state_vector());
    }
}
