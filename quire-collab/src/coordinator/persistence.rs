//! Per-document persistence writer.
//!
//! The room hands encoded updates and snapshots to a queue and moves on; one
//! writer task per document drains it, retrying failed writes with backoff.
//! A write that exhausts its retries raises an [`Alert`] and asks the room
//! for a full snapshot on its next flush, since the lost update is no longer
//! in the log.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use super::stats::StatsCounters;
use crate::backoff::BackoffPolicy;
use crate::protocol::DocumentId;
use crate::storage::{SnapshotStore, StoreError};

/// An operational alert: a storage write failed after every retry.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub document: DocumentId,
    pub operation: &'static str,
    pub attempts: u32,
    pub error: StoreError,
}

/// Receives operational alerts. Never surfaced to clients.
pub trait AlertSink: Send + Sync {
    fn alert(&self, alert: Alert);
}

/// Logs alerts at `error`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn alert(&self, alert: Alert) {
        log::error!(
            "ALERT: {} for document {} failed after {} attempts: {}",
            alert.operation,
            alert.document,
            alert.attempts,
            alert.error
        );
    }
}

/// Keeps every alert; for tests and health endpoints.
#[derive(Debug, Default)]
pub struct CollectingAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl CollectingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.alerts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.lock().is_empty()
    }
}

impl AlertSink for CollectingAlertSink {
    fn alert(&self, alert: Alert) {
        LogAlertSink.alert(alert.clone());
        self.alerts.lock().push(alert);
    }
}

#[derive(Debug)]
enum WriteJob {
    Append(Vec<u8>),
    Snapshot(Vec<u8>),
}

impl WriteJob {
    fn operation(&self) -> &'static str {
        match self {
            WriteJob::Append(_) => "append_update",
            WriteJob::Snapshot(_) => "put_snapshot",
        }
    }
}

pub(crate) struct WriterDeps {
    pub store: Arc<dyn SnapshotStore>,
    pub policy: BackoffPolicy,
    pub alerts: Arc<dyn AlertSink>,
    pub stats: Arc<StatsCounters>,
}

/// Room-side handle. Dropping it lets the writer finish its queue and exit.
pub(crate) struct PersistenceWriter {
    jobs: mpsc::UnboundedSender<WriteJob>,
    needs_snapshot: Arc<AtomicBool>,
    finished: watch::Receiver<bool>,
}

impl PersistenceWriter {
    pub fn spawn(document: DocumentId, deps: WriterDeps) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        let needs_snapshot = Arc::new(AtomicBool::new(false));
        let (done_tx, finished) = watch::channel(false);
        tokio::spawn(run_writer(document, deps, rx, needs_snapshot.clone(), done_tx));
        Self {
            jobs,
            needs_snapshot,
            finished,
        }
    }

    pub fn append(&self, update: Vec<u8>) {
        let _ = self.jobs.send(WriteJob::Append(update));
    }

    pub fn snapshot(&self, snapshot: Vec<u8>) {
        // A snapshot covers everything before it, including a lost append.
        self.needs_snapshot.store(false, Ordering::SeqCst);
        let _ = self.jobs.send(WriteJob::Snapshot(snapshot));
    }

    /// Whether an earlier write was lost and only a snapshot can repair it.
    pub fn needs_snapshot(&self) -> bool {
        self.needs_snapshot.load(Ordering::SeqCst)
    }

    /// Flips to `true` once every queued job has been handled.
    pub fn finished(&self) -> watch::Receiver<bool> {
        self.finished.clone()
    }
}

async fn run_writer(
    document: DocumentId,
    deps: WriterDeps,
    mut jobs: mpsc::UnboundedReceiver<WriteJob>,
    needs_snapshot: Arc<AtomicBool>,
    done: watch::Sender<bool>,
) {
    while let Some(job) = jobs.recv().await {
        match write_with_retry(document, &deps, &job).await {
            Ok(()) => {}
            Err(StoreError::Tombstoned(_)) => {
                log::info!("document {document} deleted; discarding queued writes");
                jobs.close();
                while jobs.recv().await.is_some() {}
                break;
            }
            Err(error) => {
                StatsCounters::incr(&deps.stats.persistence_failures);
                needs_snapshot.store(true, Ordering::SeqCst);
                deps.alerts.alert(Alert {
                    document,
                    operation: job.operation(),
                    attempts: deps.policy.max_retries.map_or(1, |n| n + 1),
                    error,
                });
            }
        }
    }
    done.send_replace(true);
    log::debug!("persistence writer for {document} finished");
}

async fn write_with_retry(document: DocumentId, deps: &WriterDeps, job: &WriteJob) -> Result<(), StoreError> {
    let mut attempt = 0;
    loop {
        match write_once(document, deps, job).await {
            Ok(()) => {
                match job {
                    WriteJob::Append(_) => StatsCounters::incr(&deps.stats.persisted_updates),
                    WriteJob::Snapshot(_) => StatsCounters::incr(&deps.stats.persisted_snapshots),
                }
                return Ok(());
            }
            Err(e @ StoreError::Tombstoned(_)) => return Err(e),
            Err(e) if deps.policy.allows(attempt) => {
                let delay = deps.policy.delay(attempt);
                log::warn!(
                    "{} for {document} failed (attempt {}): {e}; retrying in {:?}",
                    job.operation(),
                    attempt + 1,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn write_once(document: DocumentId, deps: &WriterDeps, job: &WriteJob) -> Result<(), StoreError> {
    let store = deps.store.clone();
    let (is_snapshot, bytes) = match job {
        WriteJob::Append(bytes) => (false, bytes.clone()),
        WriteJob::Snapshot(bytes) => (true, bytes.clone()),
    };
    tokio::task::spawn_blocking(move || {
        if is_snapshot {
            store.put_snapshot(document, &bytes)
        } else {
            store.append_update(document, &bytes).map(|_| ())
        }
    })
    .await
    .map_err(|e| StoreError::Unavailable(format!("writer task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use uuid::Uuid;

    fn deps(store: Arc<MemoryStore>, alerts: Arc<CollectingAlertSink>) -> (WriterDeps, Arc<StatsCounters>) {
        let stats = Arc::new(StatsCounters::default());
        (
            WriterDeps {
                store,
                policy: BackoffPolicy::for_testing(),
                alerts,
                stats: stats.clone(),
            },
            stats,
        )
    }

    async fn finish(writer: PersistenceWriter) {
        let mut done = writer.finished();
        drop(writer);
        done.wait_for(|d| *d).await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let store = Arc::new(MemoryStore::new());
        let alerts = Arc::new(CollectingAlertSink::new());
        let (deps, stats) = deps(store.clone(), alerts.clone());
        let doc = Uuid::new_v4();

        store.fail_next_writes(2);
        let writer = PersistenceWriter::spawn(doc, deps);
        writer.append(b"u1".to_vec());
        finish(writer).await;

        assert_eq!(store.update_writes(), 1);
        assert!(alerts.is_empty());
        assert_eq!(stats.snapshot().persisted_updates, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_alert_and_request_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let alerts = Arc::new(CollectingAlertSink::new());
        let (deps, stats) = deps(store.clone(), alerts.clone());
        let doc = Uuid::new_v4();

        // First attempt plus three retries.
        store.fail_next_writes(4);
        let writer = PersistenceWriter::spawn(doc, deps);
        writer.append(b"lost".to_vec());
        let mut done = writer.finished();
        while alerts.is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(writer.needs_snapshot());

        writer.snapshot(b"full".to_vec());
        assert!(!writer.needs_snapshot());
        drop(writer);
        done.wait_for(|d| *d).await.unwrap();

        let alert = &alerts.alerts()[0];
        assert_eq!(alert.document, doc);
        assert_eq!(alert.operation, "append_update");
        assert_eq!(alert.attempts, 4);
        assert_eq!(store.snapshot_writes(), 1);
        assert_eq!(stats.snapshot().persistence_failures, 1);
    }

    #[tokio::test]
    async fn test_tombstone_stops_writer() {
        let store = Arc::new(MemoryStore::new());
        let alerts = Arc::new(CollectingAlertSink::new());
        let (deps, _) = deps(store.clone(), alerts.clone());
        let doc = Uuid::new_v4();
        store.tombstone(doc).unwrap();

        let writer = PersistenceWriter::spawn(doc, deps);
        writer.append(b"a".to_vec());
        writer.snapshot(b"b".to_vec());
        finish(writer).await;

        assert!(alerts.is_empty());
        assert_eq!(store.update_writes() + store.snapshot_writes(), 0);
    }
}
