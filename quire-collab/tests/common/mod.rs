//! Shared helpers: a coordinator on an ephemeral port with a token table,
//! an in-memory store and an alert collector.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use quire_collab::{
    ClientConfig, CollectingAlertSink, Coordinator, CoordinatorConfig, DocumentId, DocumentScope, MemoryStore,
    MutationAuthority, MutatorRegistry, SnapshotStore, SyncClient, TokenTable,
};

pub struct TestServer {
    pub coordinator: Coordinator,
    pub url: String,
    pub tokens: Arc<TokenTable>,
    pub alerts: Arc<CollectingAlertSink>,
    pub authority: Arc<MutationAuthority>,
}

pub fn tokens() -> Arc<TokenTable> {
    let tokens = TokenTable::new();
    tokens.grant("alice-token", "alice", DocumentScope::All);
    tokens.grant("bob-token", "bob", DocumentScope::All);
    tokens.grant("nobody-token", "nobody", DocumentScope::Only(Default::default()));
    Arc::new(tokens)
}

pub async fn start() -> (TestServer, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let server = start_with(CoordinatorConfig::for_testing(), store.clone(), tokens()).await;
    (server, store)
}

pub async fn start_with(config: CoordinatorConfig, store: Arc<dyn SnapshotStore>, tokens: Arc<TokenTable>) -> TestServer {
    let alerts = Arc::new(CollectingAlertSink::new());
    let authority = Arc::new(MutationAuthority::new(MutatorRegistry::with_builtins()));
    let coordinator = Coordinator::builder(config, tokens.clone())
        .store(store)
        .alert_sink(alerts.clone())
        .mutation_authority(authority.clone())
        .build();

    let listener = coordinator.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = coordinator.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });

    TestServer {
        coordinator,
        url: format!("ws://{addr}"),
        tokens,
        alerts,
        authority,
    }
}

impl TestServer {
    pub fn client(&self, token: &str, document: DocumentId, replica: u64) -> SyncClient {
        SyncClient::new(
            ClientConfig::for_testing(self.url.clone(), token, document)
                .with_replica_id(replica)
                .with_display_name(format!("replica-{replica}")),
        )
    }

    pub async fn connected(&self, token: &str, document: DocumentId, replica: u64) -> SyncClient {
        let client = self.client(token, document, replica);
        client.connect().await.unwrap();
        client
    }
}

/// Poll `check` until it holds, failing after five seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
