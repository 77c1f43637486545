//! Optimistic mutations against a server authority: ordering, reconciliation,
//! replay after disconnect, rollback, and the `/mutations` WebSocket.

mod common;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use common::{eventually, start};
use quire_collab::mutation::{fixed_clock, LocalTransport, MutationFrame, MutationStatus};
use quire_collab::{
    BackoffPolicy, EntityKind, EntityStore, MutationAuthority, MutationRequest, MutatorRegistry, QuerySpec, Record,
    SyncCache, SyncContext,
};

type RawSocket = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

fn local_setup(client_ms: u64, server_ms: u64) -> (Arc<LocalTransport>, SyncCache) {
    let authority = Arc::new(MutationAuthority::with_clock(
        MutatorRegistry::with_builtins(),
        fixed_clock(server_ms),
    ));
    let transport = Arc::new(LocalTransport::new(authority));
    let cache = SyncCache::with_clock(
        "client-1",
        MutatorRegistry::with_builtins(),
        transport.clone(),
        fixed_clock(client_ms),
    );
    (transport, cache)
}

fn title(cache: &SyncCache, id: &str) -> Option<String> {
    cache
        .view()
        .get(EntityKind::Document, id)
        .and_then(|r| r.str_field("title").map(str::to_string))
}

#[tokio::test]
async fn test_later_rename_wins_despite_delay() {
    let (transport, cache) = local_setup(1_000, 2_000);
    cache
        .mutate("document.create", json!({"id": "d1", "title": "Draft"}))
        .unwrap()
        .confirmed()
        .await
        .unwrap();

    transport.set_delay(Some(Duration::from_millis(50)));
    let first = cache.mutate("document.rename", json!({"id": "d1", "title": "M1"})).unwrap();
    transport.set_delay(None);
    let second = cache.mutate("document.rename", json!({"id": "d1", "title": "M2"})).unwrap();
    assert_eq!(title(&cache, "d1").as_deref(), Some("M2"));

    second.confirmed().await.unwrap();
    first.confirmed().await.unwrap();
    let server = transport.authority().store();
    assert_eq!(server.get(EntityKind::Document, "d1").unwrap().str_field("title"), Some("M2"));
    assert_eq!(title(&cache, "d1").as_deref(), Some("M2"));
}

#[tokio::test]
async fn test_server_timestamp_replaces_guess() {
    let (_transport, cache) = local_setup(1_000, 9_000);
    let docs = cache.subscribe(QuerySpec::all(EntityKind::Document));

    let handle = cache.mutate("document.create", json!({"id": "d1", "title": "Notes"})).unwrap();
    assert_eq!(handle.local.upserted(EntityKind::Document, "d1").unwrap().u64_field("created_at"), Some(1_000));
    assert_eq!(docs.current()[0].u64_field("created_at"), Some(1_000));

    let confirmed = handle.confirmed().await.unwrap();
    assert_eq!(confirmed.upserted(EntityKind::Document, "d1").unwrap().u64_field("created_at"), Some(9_000));
    assert_eq!(docs.current()[0].u64_field("created_at"), Some(9_000));
    assert_eq!(cache.confirmed().get(EntityKind::Document, "d1").unwrap().u64_field("created_at"), Some(9_000));
}

#[tokio::test]
async fn test_replay_after_disconnect_applies_once() {
    let (transport, cache) = local_setup(1_000, 2_000);
    // Each of the first two submissions executes but its response is lost.
    transport.lose_next_responses(2);

    let create = cache.mutate("folder.create", json!({"id": "f1", "name": "Inbox"})).unwrap();
    let rename = cache.mutate("folder.rename", json!({"id": "f1", "name": "Archive"})).unwrap();
    eventually("cache offline", || !cache.is_online()).await;
    assert_eq!(cache.pending_sequences(), vec![1, 2]);

    transport.set_connected(true);
    cache.reconnect();
    eventually("offline again after second loss", || !cache.is_online()).await;
    transport.set_connected(true);
    cache.reconnect();

    create.confirmed().await.unwrap();
    rename.confirmed().await.unwrap();
    let authority = transport.authority();
    assert_eq!(authority.committed_count(), 2);
    assert!(transport.submissions() >= 4);
    let folders = authority.query(&QuerySpec::all(EntityKind::Folder));
    assert_eq!(folders.len(), 1);
    assert_eq!(folders[0].str_field("name"), Some("Archive"));
    assert_eq!(cache.pending_count(), 0);
}

#[tokio::test]
async fn test_rejected_rename_rolls_back_with_reason() {
    let (transport, cache) = local_setup(1_000, 2_000);
    let old = Record::new(EntityKind::Document, "d1").with("title", "Old Name");
    transport.authority().load(EntityStore::from_records([
        old.clone(),
        Record::new(EntityKind::Document, "d2").with("title", "New Name"),
    ]));
    cache.seed(EntityStore::from_records([old]));

    let handle = cache.mutate("document.rename", json!({"id": "d1", "title": "New Name"})).unwrap();
    assert_eq!(title(&cache, "d1").as_deref(), Some("New Name"));

    let failure = handle.confirmed().await.unwrap_err();
    assert_eq!(failure.reason, "duplicate");
    assert_eq!(title(&cache, "d1").as_deref(), Some("Old Name"));
    assert_eq!(cache.pending_count(), 0);
}

#[tokio::test]
async fn test_restarted_cache_reuses_client_id() {
    let (transport, cache) = local_setup(1_000, 2_000);
    for id in ["f1", "f2"] {
        cache
            .mutate("folder.create", json!({"id": id, "name": id}))
            .unwrap()
            .confirmed()
            .await
            .unwrap();
    }
    drop(cache);

    let restarted = SyncCache::with_clock(
        "client-1",
        MutatorRegistry::with_builtins(),
        transport.clone(),
        fixed_clock(3_000),
    );
    restarted.resync().await.unwrap();
    assert_eq!(restarted.confirmed_version(), 2);

    let handle = restarted.mutate("folder.create", json!({"id": "f3", "name": "f3"})).unwrap();
    assert_eq!(handle.sequence, 1);
    handle.confirmed().await.unwrap();
    assert_eq!(transport.authority().committed_count(), 3);
    assert_eq!(restarted.confirmed().of_kind(EntityKind::Folder).count(), 3);
}

fn request(seq: u64, name: &str, args: serde_json::Value) -> MutationRequest {
    MutationRequest {
        mutation_name: name.to_string(),
        args,
        client_id: "raw".to_string(),
        epoch: Uuid::nil(),
        client_mutation_id: Uuid::new_v4(),
        sequence_number: seq,
        issued_at_ms: 0,
        acknowledged_through: 0,
    }
}

#[tokio::test]
async fn test_endpoint_orders_reordered_requests() {
    let (server, _) = start().await;
    let url = format!("{}/mutations?token=alice-token", server.url);
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    let frames = [
        request(3, "document.rename", json!({"id": "d1", "title": "Second"})),
        request(2, "document.rename", json!({"id": "d1", "title": "First"})),
        request(1, "document.create", json!({"id": "d1", "title": "Draft"})),
    ];
    for request in frames {
        let text = MutationFrame::Request(request).encode().unwrap();
        ws.send(Message::text(text)).await.unwrap();
    }

    let mut committed = Vec::new();
    while committed.len() < 3 {
        let Some(Ok(Message::Text(text))) = ws.next().await else {
            panic!("mutation socket closed early");
        };
        if let MutationFrame::Response(response) = MutationFrame::decode(text.as_str()).unwrap() {
            assert_eq!(response.status, MutationStatus::Committed);
            committed.push(response.sequence_number);
        }
    }
    committed.sort();
    assert_eq!(committed, vec![1, 2, 3]);
    let doc = server.authority.store().get(EntityKind::Document, "d1").cloned().unwrap();
    assert_eq!(doc.str_field("title"), Some("Second"));
    assert_eq!(server.coordinator.stats().committed_mutations, 3);
}

async fn next_frame(ws: &mut RawSocket) -> MutationFrame {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return MutationFrame::decode(text.as_str()).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("mutation socket ended: {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_resync_frame_returns_versioned_state() {
    let (server, _) = start().await;
    let url = format!("{}/mutations?token=alice-token", server.url);
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    let create = request(1, "folder.create", json!({"id": "f1", "name": "Inbox"}));
    ws.send(Message::text(MutationFrame::Request(create).encode().unwrap()))
        .await
        .unwrap();

    // The issuer gets the push as well as the response, push first.
    let MutationFrame::Effect(pushed) = next_frame(&mut ws).await else {
        panic!("expected the pushed effect first");
    };
    assert_eq!(pushed.version, 1);
    let MutationFrame::Response(response) = next_frame(&mut ws).await else {
        panic!("expected the response");
    };
    assert_eq!(response.version, Some(1));

    ws.send(Message::text(MutationFrame::Resync.encode().unwrap())).await.unwrap();
    let MutationFrame::State(state) = next_frame(&mut ws).await else {
        panic!("expected confirmed state");
    };
    assert_eq!(state.version, 1);
    assert_eq!(state.records.len(), 1);
    assert_eq!(state.records[0].str_field("name"), Some("Inbox"));
}

#[tokio::test]
async fn test_late_context_starts_from_confirmed_state() {
    let (server, _) = start().await;
    let alice = SyncContext::create(&server.url, "alice-token", "alice-cache", MutatorRegistry::with_builtins())
        .await
        .unwrap();
    let alice_cache = alice.cache().unwrap();
    for id in ["f1", "f2"] {
        alice_cache
            .mutate("folder.create", json!({"id": id, "name": id}))
            .unwrap()
            .confirmed()
            .await
            .unwrap();
    }
    drop(alice_cache);
    drop(alice);

    // Same client id, new process: starts at sequence 1 on a fresh epoch.
    let again = SyncContext::create(&server.url, "alice-token", "alice-cache", MutatorRegistry::with_builtins())
        .await
        .unwrap();
    let cache = again.cache().unwrap();
    assert_eq!(cache.confirmed_version(), 2);
    assert_eq!(cache.view().of_kind(EntityKind::Folder).count(), 2);
    cache
        .mutate("folder.create", json!({"id": "f3", "name": "f3"}))
        .unwrap()
        .confirmed()
        .await
        .unwrap();
    assert_eq!(server.authority.committed_count(), 3);
}

#[tokio::test]
async fn test_contexts_share_state_through_coordinator() {
    let (server, _) = start().await;
    let mut alice = SyncContext::create(&server.url, "alice-token", "alice-cache", MutatorRegistry::with_builtins())
        .await
        .unwrap();
    alice.set_reconnect_policy(BackoffPolicy::for_testing());
    let bob = SyncContext::create(&server.url, "bob-token", "bob-cache", MutatorRegistry::with_builtins())
        .await
        .unwrap();

    let bob_cache = bob.cache().unwrap();
    let mut bob_folders = bob_cache.subscribe(QuerySpec::all(EntityKind::Folder));

    let alice_cache = alice.cache().unwrap();
    alice_cache
        .mutate("folder.create", json!({"id": "f1", "name": "Shared"}))
        .unwrap()
        .confirmed()
        .await
        .unwrap();

    let rows = tokio::time::timeout(Duration::from_secs(5), bob_folders.changed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rows[0].str_field("name"), Some("Shared"));

    bob_cache
        .mutate("folder.create", json!({"id": "f2", "name": "Other"}))
        .unwrap()
        .confirmed()
        .await
        .unwrap();
    eventually("alice sees bob's folder", || alice_cache.view().contains(EntityKind::Folder, "f2")).await;

    // Document clients share the context's credentials.
    let doc = Uuid::new_v4();
    let editor = alice.open_document(doc).unwrap();
    editor.connect().await.unwrap();
    editor.insert(0, "from context").unwrap();
    eventually("room merged", || server.coordinator.stats().relayed_updates >= 1).await;

    alice.close();
    assert!(alice.cache().is_err());
}
