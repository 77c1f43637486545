//! End-to-end document sync through a real coordinator.

mod common;

use futures_util::{SinkExt, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use common::{eventually, start};
use quire_collab::{ConnectionState, MessageType, SyncEvent, SyncMessage};

#[tokio::test]
async fn test_edits_reach_other_clients() {
    let (server, _) = start().await;
    let doc = Uuid::new_v4();
    let alice = server.connected("alice-token", doc, 1).await;
    let bob = server.connected("bob-token", doc, 2).await;
    let mut bob_events = bob.take_events().unwrap();

    alice.insert(0, "Hello").unwrap();
    eventually("bob sees alice's insert", || bob.text() == "Hello").await;

    bob.insert(5, ", world").unwrap();
    alice.delete(0, 1).unwrap();
    eventually("convergence", || alice.text() == "ello, world" && bob.text() == "ello, world").await;
    assert_eq!(alice.snapshot().unwrap(), bob.snapshot().unwrap());

    let mut saw_remote = false;
    while let Ok(event) = bob_events.try_recv() {
        saw_remote |= matches!(event, SyncEvent::RemoteChange(_));
    }
    assert!(saw_remote);
    assert!(server.coordinator.stats().relayed_updates >= 3);
}

#[tokio::test]
async fn test_late_joiner_receives_full_state() {
    let (server, _) = start().await;
    let doc = Uuid::new_v4();
    let alice = server.connected("alice-token", doc, 1).await;
    alice.insert(0, "existing text").unwrap();
    eventually("room merged", || server.coordinator.stats().relayed_updates >= 1).await;

    let carol = server.connected("bob-token", doc, 3).await;
    eventually("carol synced", || carol.text() == "existing text").await;
}

#[tokio::test]
async fn test_concurrent_offline_inserts_follow_tie_break() {
    let (server, _) = start().await;

    // Higher replica id takes the left slot on equal Lamport clocks.
    for (alice_replica, bob_replica, expected) in [(1, 2, "WorldHello"), (2, 1, "HelloWorld")] {
        let doc = Uuid::new_v4();
        let alice = server.client("alice-token", doc, alice_replica);
        let bob = server.client("bob-token", doc, bob_replica);
        alice.insert(0, "Hello").unwrap();
        bob.insert(0, "World").unwrap();

        alice.connect().await.unwrap();
        bob.connect().await.unwrap();
        eventually("two-editor convergence", || alice.text() == expected && bob.text() == expected).await;
    }
}

#[tokio::test]
async fn test_randomized_editing_converges() {
    let (server, _) = start().await;
    let doc = Uuid::new_v4();
    let clients = vec![
        server.connected("alice-token", doc, 11).await,
        server.connected("bob-token", doc, 12).await,
        server.connected("alice-token", doc, 13).await,
    ];
    let mut rng = StdRng::seed_from_u64(7);

    for round in 0..60 {
        let client = &clients[rng.gen_range(0..clients.len())];
        let len = client.text().chars().count();
        if len > 3 && rng.gen_bool(0.3) {
            let index = rng.gen_range(0..len - 1);
            client.delete(index, 1).unwrap();
        } else {
            let index = rng.gen_range(0..=len);
            client.insert(index, format!("{}", round % 10)).unwrap();
        }
        if round % 10 == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    eventually("all replicas converge", || {
        let first = clients[0].snapshot().unwrap();
        clients.iter().all(|c| c.snapshot().unwrap() == first)
    })
    .await;
}

#[tokio::test]
async fn test_offline_edits_are_pushed_on_reconnect() {
    let (server, _) = start().await;
    let doc = Uuid::new_v4();
    let alice = server.connected("alice-token", doc, 1).await;
    let bob = server.connected("bob-token", doc, 2).await;

    alice.insert(0, "shared ").unwrap();
    eventually("bob synced", || bob.text() == "shared ").await;

    bob.disconnect().await;
    bob.insert(7, "offline").unwrap();
    alice.insert(0, ">").unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(alice.text(), ">shared ");

    bob.connect().await.unwrap();
    eventually("offline edit delivered", || {
        alice.text() == ">shared offline" && bob.text() == ">shared offline"
    })
    .await;
}

#[tokio::test]
async fn test_awareness_is_relayed_and_cleared() {
    let (server, _) = start().await;
    let doc = Uuid::new_v4();
    let alice = server.connected("alice-token", doc, 1).await;
    let bob = server.connected("bob-token", doc, 2).await;

    alice.set_cursor(Some(3), None);
    eventually("bob sees alice's cursor", || {
        bob.awareness_states().iter().any(|s| s.client_id == 1 && s.cursor == Some(3))
    })
    .await;
    let state = bob.awareness_states().into_iter().find(|s| s.client_id == 1).unwrap();
    assert_eq!(state.display_name, "replica-1");

    // A late joiner gets the current states on join.
    let carol = server.connected("bob-token", doc, 3).await;
    eventually("carol sees alice", || carol.awareness_states().iter().any(|s| s.client_id == 1)).await;

    alice.disconnect().await;
    eventually("cursor removed", || bob.awareness_states().iter().all(|s| s.client_id != 1)).await;

    // Reconnecting announces the cursor again.
    alice.connect().await.unwrap();
    alice.set_cursor(Some(4), None);
    eventually("cursor back", || {
        bob.awareness_states().iter().any(|s| s.client_id == 1 && s.cursor == Some(4))
    })
    .await;
}

#[tokio::test]
async fn test_documents_are_isolated() {
    let (server, _) = start().await;
    let (doc_a, doc_b) = (Uuid::new_v4(), Uuid::new_v4());
    let a1 = server.connected("alice-token", doc_a, 1).await;
    let a2 = server.connected("bob-token", doc_a, 2).await;
    let b1 = server.connected("bob-token", doc_b, 3).await;

    a1.insert(0, "only in A").unwrap();
    b1.insert(0, "only in B").unwrap();
    eventually("doc A synced", || a2.text() == "only in A").await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(b1.text(), "only in B");

    let mut active = server.coordinator.active_documents();
    active.sort();
    let mut expected = vec![doc_a, doc_b];
    expected.sort();
    assert_eq!(active, expected);
}

#[tokio::test]
async fn test_ping_is_answered_with_pong() {
    let (server, _) = start().await;
    let doc = Uuid::new_v4();
    let url = format!("{}/documents/{doc}?token=alice-token", server.url);
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    let ping = SyncMessage::ping(doc).encode().unwrap();
    ws.send(Message::Binary(ping.into())).await.unwrap();

    let mut got_pong = false;
    while let Some(Ok(msg)) = ws.next().await {
        if let Message::Binary(data) = msg {
            if SyncMessage::decode(&data).unwrap().msg_type == MessageType::Pong {
                got_pong = true;
                break;
            }
        }
    }
    assert!(got_pong);
}

#[tokio::test]
async fn test_undecodable_frames_are_dropped() {
    let (server, _) = start().await;
    let doc = Uuid::new_v4();
    let alice = server.connected("alice-token", doc, 1).await;
    let bob = server.connected("bob-token", doc, 2).await;

    let url = format!("{}/documents/{doc}?token=alice-token", server.url);
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let garbage = SyncMessage::update(doc, 1, vec![0xff, 0x00, 0x13]).encode().unwrap();
    ws.send(Message::Binary(garbage.into())).await.unwrap();

    alice.insert(0, "still fine").unwrap();
    eventually("relay continues", || bob.text() == "still fine").await;
    eventually("bad batch counted", || server.coordinator.stats().dropped_batches >= 1).await;
    assert_eq!(alice.state(), ConnectionState::Connected);
}
