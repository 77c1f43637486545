//! Persistence through the coordinator: debounced flushes, snapshots,
//! recovery after restart, storage failures and deletion.

mod common;

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use common::{eventually, start, start_with, tokens};
use quire_collab::storage::StoreConfig;
use quire_collab::{
    ConnectError, ConnectionState, CoordinatorConfig, DocumentStore, MemoryStore, RejectReason, Replica,
    RichTextDocument, SnapshotStore,
};

fn replay(store: &dyn SnapshotStore, doc: Uuid) -> RichTextDocument {
    let stored = store.load(doc).unwrap().expect("document stored");
    let mut replica = RichTextDocument::new(99);
    if let Some(snapshot) = stored.snapshot {
        replica.load_snapshot(&snapshot).unwrap();
    }
    for update in &stored.updates {
        replica.apply_encoded_batch(update).unwrap();
    }
    replica
}

#[tokio::test]
async fn test_updates_are_flushed_after_debounce() {
    let (server, store) = start().await;
    let doc = Uuid::new_v4();
    let alice = server.connected("alice-token", doc, 1).await;

    alice.insert(0, "one").unwrap();
    alice.insert(3, " two").unwrap();
    eventually("first flush", || store.update_writes() == 1).await;
    assert_eq!(replay(store.as_ref(), doc).text(), "one two");
    assert_eq!(store.snapshot_writes(), 0);
}

#[tokio::test]
async fn test_periodic_snapshot_truncates_log() {
    let (server, store) = start().await;
    let doc = Uuid::new_v4();
    let alice = server.connected("alice-token", doc, 1).await;

    // Testing config snapshots every third flush.
    for (i, word) in ["a", "b", "c"].into_iter().enumerate() {
        alice.insert(i, word).unwrap();
        eventually("flush", || store.update_writes() + store.snapshot_writes() == i as u64 + 1).await;
    }
    assert_eq!(store.snapshot_writes(), 1);
    assert_eq!(store.pending_updates(doc), 0);
    assert_eq!(replay(store.as_ref(), doc).text(), "abc");
}

#[tokio::test]
async fn test_last_leave_writes_snapshot_and_recovers() {
    let store = Arc::new(MemoryStore::new());
    let doc = Uuid::new_v4();
    {
        let server = start_with(CoordinatorConfig::for_testing(), store.clone(), tokens()).await;
        let alice = server.connected("alice-token", doc, 1).await;
        alice.insert(0, "survives restarts").unwrap();
        eventually("merged", || server.coordinator.stats().relayed_updates == 1).await;
        alice.disconnect().await;
        eventually("final snapshot", || store.snapshot_writes() == 1).await;
        eventually("room closed", || server.coordinator.active_documents().is_empty()).await;
        server.coordinator.shutdown().await;
    }

    let server = start_with(CoordinatorConfig::for_testing(), store.clone(), tokens()).await;
    assert_eq!(server.coordinator.known_documents().await.unwrap(), vec![doc]);
    let bob = server.connected("bob-token", doc, 2).await;
    eventually("recovered state", || bob.text() == "survives restarts").await;
}

#[tokio::test]
async fn test_storage_failure_alerts_without_disturbing_clients() {
    let (server, store) = start().await;
    let doc = Uuid::new_v4();
    let alice = server.connected("alice-token", doc, 1).await;
    let bob = server.connected("bob-token", doc, 2).await;

    // First attempt plus three retries, all failing.
    store.fail_next_writes(4);
    alice.insert(0, "kept in memory").unwrap();
    eventually("bob synced", || bob.text() == "kept in memory").await;
    eventually("alert raised", || !server.alerts.is_empty()).await;

    let alert = &server.alerts.alerts()[0];
    assert_eq!(alert.document, doc);
    assert_eq!(alert.attempts, 4);
    assert_eq!(alice.state(), ConnectionState::Connected);
    assert_eq!(bob.state(), ConnectionState::Connected);

    // The lost update is repaired by a snapshot on the next flush.
    eventually("repair snapshot", || store.snapshot_writes() >= 1).await;
    assert_eq!(replay(store.as_ref(), doc).text(), "kept in memory");
    assert_eq!(server.coordinator.stats().persistence_failures, 1);
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let (server, store) = start().await;
    let doc = Uuid::new_v4();
    let alice = server.connected("alice-token", doc, 1).await;

    store.fail_next_writes(2);
    alice.insert(0, "eventually written").unwrap();
    eventually("write succeeded", || store.update_writes() == 1).await;
    assert!(server.alerts.is_empty());
    assert_eq!(replay(store.as_ref(), doc).text(), "eventually written");
}

#[tokio::test]
async fn test_delete_disconnects_with_4410() {
    let (server, store) = start().await;
    let doc = Uuid::new_v4();
    let alice = server.connected("alice-token", doc, 1).await;
    alice.insert(0, "doomed").unwrap();
    eventually("flushed", || store.update_writes() == 1).await;

    server.coordinator.delete_document(doc).await.unwrap();
    eventually("session closed", || {
        alice.state() == ConnectionState::Rejected(RejectReason::DocumentDeleted)
    })
    .await;

    let again = server.client("bob-token", doc, 2);
    assert_eq!(
        again.connect().await,
        Err(ConnectError::Rejected(RejectReason::DocumentDeleted))
    );
    assert!(store.is_tombstoned(doc).unwrap());
    assert!(server.coordinator.known_documents().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rocksdb_store_behind_coordinator() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap());
    let server = start_with(CoordinatorConfig::for_testing(), store.clone(), tokens()).await;
    let doc = Uuid::new_v4();

    let alice = server.connected("alice-token", doc, 1).await;
    alice.insert(0, "on disk").unwrap();
    eventually("flushed to rocksdb", || {
        store
            .load(doc)
            .ok()
            .flatten()
            .is_some_and(|stored| !stored.updates.is_empty() || stored.snapshot.is_some())
    })
    .await;
    assert_eq!(replay(store.as_ref(), doc).text(), "on disk");

    alice.disconnect().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(replay(store.as_ref(), doc).text(), "on disk");
}
