//! Awareness: ephemeral presence for collaborators on one document.
//!
//! Cursors, selections and profile data ride the same connection as document
//! updates but are never persisted and never enter the CRDT history.
//!
//! ```text
//! local cursor move
//!       │
//!       ▼
//! Awareness::broadcast_local_state()  ──► AwarenessUpdate::Update { clock+1 }
//!                                                │  (SyncMessage::Awareness)
//!                                                ▼
//!                                  remote Awareness::apply_update()
//!                                                │
//!                                                ▼
//!                                  watch::Receiver<Vec<AwarenessState>>
//! ```
//!
//! Entries not refreshed within the stale timeout are dropped so abrupt
//! disconnects leave no ghost cursors behind.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::protocol::ProtocolError;

/// Opaque id of one client session.
pub type ClientId = u64;

/// Default staleness window: three missed heartbeats at the default 10 s interval.
pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_AWARENESS_BYTES: usize = 64 * 1024;

/// A selection in visible-character coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: usize,
    pub head: usize,
}

/// Presence of one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub client_id: ClientId,
    /// Caret position (None = not focused).
    pub cursor: Option<usize>,
    pub selection: Option<Selection>,
    pub display_name: String,
    /// `#rrggbb`
    pub color: String,
    /// Per-client counter; higher wins.
    pub clock: u64,
}

impl AwarenessState {
    /// A fresh state with a stable color derived from the client id.
    pub fn new(client_id: ClientId, display_name: impl Into<String>) -> Self {
        Self {
            client_id,
            cursor: None,
            selection: None,
            display_name: display_name.into(),
            color: color_for(client_id),
            clock: 0,
        }
    }
}

/// Stable, vivid `#rrggbb` color for a client.
pub fn color_for(client_id: ClientId) -> String {
    let hue = (client_id.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as f32 % 360.0 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Awareness message carried inside `SyncMessage::Awareness` payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AwarenessUpdate {
    /// New or refreshed state.
    Update(AwarenessState),
    /// Client left.
    Remove { client_id: ClientId, clock: u64 },
}

impl AwarenessUpdate {
    pub fn client_id(&self) -> ClientId {
        match self {
            AwarenessUpdate::Update(state) => state.client_id,
            AwarenessUpdate::Remove { client_id, .. } => *client_id,
        }
    }

    pub fn clock(&self) -> u64 {
        match self {
            AwarenessUpdate::Update(state) => state.clock,
            AwarenessUpdate::Remove { clock, .. } => *clock,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (update, _) = bincode::serde::decode_from_slice(
            bytes,
            bincode::config::standard().with_limit::<MAX_AWARENESS_BYTES>(),
        )
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(update)
    }
}

#[derive(Debug)]
struct Entry {
    state: AwarenessState,
    last_seen: Instant,
}

/// Presence registry for one document, as seen by one participant.
///
/// Clients hold one with their own id; the coordinator holds one per room
/// (with client id 0) so new joiners can be sent everyone's current state.
pub struct Awareness {
    local_id: ClientId,
    local_clock: u64,
    entries: HashMap<ClientId, Entry>,
    /// Clock at which a client was removed, so late updates cannot revive it.
    removed: HashMap<ClientId, u64>,
    stale_timeout: Duration,
    changes: watch::Sender<Vec<AwarenessState>>,
}

impl Awareness {
    pub fn new(local_id: ClientId) -> Self {
        Self::with_timeout(local_id, DEFAULT_STALE_TIMEOUT)
    }

    pub fn with_timeout(local_id: ClientId, stale_timeout: Duration) -> Self {
        let (changes, _) = watch::channel(Vec::new());
        Self {
            local_id,
            local_clock: 0,
            entries: HashMap::new(),
            removed: HashMap::new(),
            stale_timeout,
            changes,
        }
    }

    pub fn local_id(&self) -> ClientId {
        self.local_id
    }

    /// Live view of every known state, local included. Updated on each change.
    pub fn subscribe(&self) -> watch::Receiver<Vec<AwarenessState>> {
        self.changes.subscribe()
    }

    /// Every known state ordered by client id.
    pub fn states(&self) -> Vec<AwarenessState> {
        let mut states: Vec<AwarenessState> = self.entries.values().map(|e| e.state.clone()).collect();
        states.sort_by_key(|s| s.client_id);
        states
    }

    pub fn get(&self, client_id: ClientId) -> Option<&AwarenessState> {
        self.entries.get(&client_id).map(|e| &e.state)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Publish a new local state. The client id and clock are filled in here.
    pub fn broadcast_local_state(&mut self, mut state: AwarenessState) -> AwarenessUpdate {
        self.local_clock += 1;
        state.client_id = self.local_id;
        state.clock = self.local_clock;
        self.entries.insert(
            self.local_id,
            Entry {
                state: state.clone(),
                last_seen: Instant::now(),
            },
        );
        self.notify();
        AwarenessUpdate::Update(state)
    }

    /// Re-announce the local state with a bumped clock (heartbeat).
    pub fn refresh_local(&mut self) -> Option<AwarenessUpdate> {
        let state = self.entries.get(&self.local_id)?.state.clone();
        Some(self.broadcast_local_state(state))
    }

    /// Retract the local state.
    pub fn remove_local(&mut self) -> AwarenessUpdate {
        self.local_clock += 1;
        self.entries.remove(&self.local_id);
        self.notify();
        AwarenessUpdate::Remove {
            client_id: self.local_id,
            clock: self.local_clock,
        }
    }

    /// Merge an update from elsewhere. Returns whether anything changed.
    pub fn apply_update(&mut self, update: &AwarenessUpdate) -> bool {
        self.apply_update_at(update, Instant::now())
    }

    fn apply_update_at(&mut self, update: &AwarenessUpdate, now: Instant) -> bool {
        let client_id = update.client_id();
        if client_id == self.local_id {
            return false;
        }
        let clock = update.clock();
        let current = self.entries.get(&client_id).map(|e| e.state.clock);
        if current.is_some_and(|c| clock <= c) || self.removed.get(&client_id).is_some_and(|c| clock <= *c) {
            return false;
        }

        match update {
            AwarenessUpdate::Update(state) => {
                self.entries.insert(
                    client_id,
                    Entry {
                        state: state.clone(),
                        last_seen: now,
                    },
                );
                self.removed.remove(&client_id);
            }
            AwarenessUpdate::Remove { .. } => {
                self.removed.insert(client_id, clock);
                if self.entries.remove(&client_id).is_none() {
                    return false;
                }
            }
        }
        self.notify();
        true
    }

    /// Drop a remote client outright (its connection closed). Returns the
    /// removal update to forward, if the client was known.
    pub fn remove_client(&mut self, client_id: ClientId) -> Option<AwarenessUpdate> {
        let entry = self.entries.remove(&client_id)?;
        let clock = entry.state.clock + 1;
        self.removed.insert(client_id, clock);
        self.notify();
        Some(AwarenessUpdate::Remove { client_id, clock })
    }

    /// Clear the removal marker for `client_id` so a new connection can
    /// announce it again from any clock.
    pub fn forget_removed(&mut self, client_id: ClientId) {
        self.removed.remove(&client_id);
    }

    /// Drop remote entries not refreshed within the stale timeout.
    pub fn remove_stale(&mut self) -> Vec<AwarenessUpdate> {
        self.remove_stale_at(Instant::now())
    }

    fn remove_stale_at(&mut self, now: Instant) -> Vec<AwarenessUpdate> {
        let timeout = self.stale_timeout;
        let stale: Vec<ClientId> = self
            .entries
            .iter()
            .filter(|(id, e)| **id != self.local_id && now.saturating_duration_since(e.last_seen) > timeout)
            .map(|(id, _)| *id)
            .collect();

        let removals: Vec<AwarenessUpdate> = stale.into_iter().filter_map(|id| self.remove_client(id)).collect();
        if !removals.is_empty() {
            log::debug!("Dropped {} stale awareness entries", removals.len());
        }
        removals
    }

    fn notify(&self) {
        self.changes.send_replace(self.states());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(client_id: ClientId, clock: u64, cursor: usize) -> AwarenessUpdate {
        let mut state = AwarenessState::new(client_id, format!("peer-{client_id}"));
        state.cursor = Some(cursor);
        state.clock = clock;
        AwarenessUpdate::Update(state)
    }

    #[test]
    fn test_broadcast_local_state_bumps_clock() {
        let mut awareness = Awareness::new(7);
        let first = awareness.broadcast_local_state(AwarenessState::new(0, "me"));
        let second = awareness.broadcast_local_state(AwarenessState::new(0, "me"));

        assert_eq!(first.client_id(), 7);
        assert_eq!(first.clock(), 1);
        assert_eq!(second.clock(), 2);
        assert_eq!(awareness.len(), 1);
    }

    #[test]
    fn test_older_updates_are_ignored() {
        let mut awareness = Awareness::new(1);
        assert!(awareness.apply_update(&remote(2, 5, 10)));
        assert!(!awareness.apply_update(&remote(2, 4, 99)));
        assert!(!awareness.apply_update(&remote(2, 5, 99)));
        assert_eq!(awareness.get(2).and_then(|s| s.cursor), Some(10));
    }

    #[test]
    fn test_own_echo_is_ignored() {
        let mut awareness = Awareness::new(1);
        assert!(!awareness.apply_update(&remote(1, 100, 0)));
        assert!(awareness.is_empty());
    }

    #[test]
    fn test_removal_is_not_revived_by_late_update() {
        let mut awareness = Awareness::new(1);
        awareness.apply_update(&remote(2, 3, 0));
        assert!(awareness.apply_update(&AwarenessUpdate::Remove { client_id: 2, clock: 4 }));
        assert!(!awareness.apply_update(&remote(2, 3, 0)));
        assert!(awareness.get(2).is_none());

        // A genuinely newer state brings it back.
        assert!(awareness.apply_update(&remote(2, 5, 1)));
        assert_eq!(awareness.len(), 1);
    }

    #[test]
    fn test_stale_entries_removed() {
        let mut awareness = Awareness::with_timeout(1, Duration::from_secs(30));
        awareness.broadcast_local_state(AwarenessState::new(1, "me"));
        let start = Instant::now();
        awareness.apply_update_at(&remote(2, 1, 0), start);
        awareness.apply_update_at(&remote(3, 1, 0), start + Duration::from_secs(20));

        let removed = awareness.remove_stale_at(start + Duration::from_secs(31));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].client_id(), 2);
        // Local state never goes stale.
        assert!(awareness.get(1).is_some());
        assert!(awareness.get(3).is_some());
    }

    #[test]
    fn test_subscribers_see_all_states() {
        let mut awareness = Awareness::new(1);
        let rx = awareness.subscribe();
        awareness.broadcast_local_state(AwarenessState::new(1, "me"));
        awareness.apply_update(&remote(2, 1, 4));

        let states = rx.borrow().clone();
        assert_eq!(states.iter().map(|s| s.client_id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_update_wire_roundtrip() {
        let update = remote(42, 9, 3);
        let decoded = AwarenessUpdate::decode(&update.encode().unwrap()).unwrap();
        assert_eq!(decoded, update);
        assert!(AwarenessUpdate::decode(&[0xFF, 0xFF]).is_err());
    }

    #[test]
    fn test_color_is_stable_hex() {
        let color = color_for(12345);
        assert_eq!(color, color_for(12345));
        assert_eq!(color.len(), 7);
        assert!(color.starts_with('#'));
    }

    #[test]
    fn test_forget_removed_allows_rejoin() {
        let mut awareness = Awareness::new(0);
        assert!(awareness.apply_update(&remote(9, 3, 1)));
        let removal = awareness.remove_client(9).unwrap();
        assert_eq!(removal.clock(), 4);
        assert!(!awareness.apply_update(&remote(9, 4, 2)));

        awareness.forget_removed(9);
        assert!(awareness.apply_update(&remote(9, 4, 2)));
        assert_eq!(awareness.get(9).and_then(|s| s.cursor), Some(2));
    }
}
