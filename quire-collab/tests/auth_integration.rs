//! Authorization gate: every refusal closes with its own code and carries no
//! document content.

mod common;

use futures_util::StreamExt;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use common::{eventually, start};
use quire_collab::{ConnectError, ConnectionState, DocumentScope, RejectReason};

/// Connect raw and return the close code plus how many data frames arrived first.
async fn close_code(url: &str) -> (Option<u16>, usize) {
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    let mut data_frames = 0;
    while let Some(msg) = ws.next().await {
        match msg {
            Ok(Message::Binary(_)) | Ok(Message::Text(_)) => data_frames += 1,
            Ok(Message::Close(frame)) => return (frame.map(|f| u16::from(f.code)), data_frames),
            Ok(_) => {}
            Err(_) => break,
        }
    }
    (None, data_frames)
}

#[tokio::test]
async fn test_rejections_use_distinct_close_codes() {
    let (server, _) = start().await;
    let doc = Uuid::new_v4();
    let alice = server.connected("alice-token", doc, 1).await;
    alice.insert(0, "secret").unwrap();
    eventually("room has content", || server.coordinator.stats().relayed_updates >= 1).await;

    let cases = [
        (format!("{}/documents/not-a-uuid?token=alice-token", server.url), 4400),
        (format!("{}/elsewhere", server.url), 4400),
        (format!("{}/documents/{doc}", server.url), 4401),
        (format!("{}/documents/{doc}?token=wrong", server.url), 4402),
        (format!("{}/documents/{doc}?token=nobody-token", server.url), 4403),
    ];
    for (url, expected) in cases {
        let (code, data_frames) = close_code(&url).await;
        assert_eq!(code, Some(expected), "{url}");
        assert_eq!(data_frames, 0, "{url} leaked document frames");
    }
    assert_eq!(server.coordinator.stats().rejected_connections, 5);
}

#[tokio::test]
async fn test_client_surfaces_rejection() {
    let (server, _) = start().await;
    let client = server.client("nobody-token", Uuid::new_v4(), 1);

    assert_eq!(client.connect().await, Err(ConnectError::Rejected(RejectReason::Forbidden)));
    assert_eq!(client.state(), ConnectionState::Rejected(RejectReason::Forbidden));
    assert_eq!(client.text(), "");
}

#[tokio::test]
async fn test_token_with_reserved_characters_is_accepted() {
    let (server, _) = start().await;
    let token = "q7+Zk/9w==&x%41";
    server.tokens.grant(token, "carol", DocumentScope::All);

    let client = server.client(token, Uuid::new_v4(), 1);
    client.connect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(server.coordinator.stats().rejected_connections, 0);
}

#[tokio::test]
async fn test_supervisor_does_not_retry_rejection() {
    let (server, _) = start().await;
    let client = server.client("wrong", Uuid::new_v4(), 1);

    let result = tokio::time::timeout(Duration::from_secs(2), client.run()).await.unwrap();
    assert_eq!(result, Err(ConnectError::Rejected(RejectReason::InvalidToken)));
    assert_eq!(server.coordinator.stats().rejected_connections, 1);
}

#[tokio::test]
async fn test_revoked_token_is_disconnected_at_next_check() {
    let (server, _) = start().await;
    let doc = Uuid::new_v4();
    server.tokens.grant("temp-token", "temp", quire_collab::DocumentScope::All);
    let alice = server.connected("alice-token", doc, 1).await;
    let temp = server.connected("temp-token", doc, 2).await;

    server.tokens.revoke("temp-token");
    // The next flush re-checks every member's token.
    alice.insert(0, "trigger").unwrap();

    eventually("revoked session closed", || {
        temp.state() == ConnectionState::Rejected(RejectReason::InvalidToken)
    })
    .await;
    assert_eq!(alice.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_mutation_endpoint_requires_token() {
    let (server, _) = start().await;
    let (code, _) = close_code(&format!("{}/mutations", server.url)).await;
    assert_eq!(code, Some(4401));
    let (code, _) = close_code(&format!("{}/mutations?token=wrong", server.url)).await;
    assert_eq!(code, Some(4402));
}
