//! Single-writer persistence queue.
//!
//! Callers hand over full document snapshots; one background task writes
//! them in issue order. When several snapshots are waiting only the newest
//! is written, so a later state never loses to an earlier one. Failed writes
//! are retried on a fixed schedule and then dropped with an error log.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::{DocumentStore, Result, StorageError};

/// Waits between write attempts plus a per-attempt timeout.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    pub delays: Vec<Duration>,
    pub attempt_timeout: Duration,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(10),
            ],
            attempt_timeout: Duration::from_secs(20),
        }
    }
}

struct WriteRequest {
    seq: u64,
    document: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
struct WriteStatus {
    seq: u64,
    error: Option<String>,
}

/// Cloneable handle used to queue writes and observe their completion.
#[derive(Clone)]
pub struct PersistHandle {
    tx: mpsc::UnboundedSender<WriteRequest>,
    issued: Arc<AtomicU64>,
    status: watch::Receiver<WriteStatus>,
}

impl PersistHandle {
    /// Queue a full-document write without waiting for it. Returns the
    /// write's sequence number.
    ///
    /// Callers that race each other must serialize around this call; the
    /// sequence number is what decides which snapshot is newest.
    pub fn enqueue(&self, document: serde_json::Value) -> Result<u64> {
        let seq = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        self.tx
            .send(WriteRequest { seq, document })
            .map_err(|_| StorageError::QueueClosed)?;
        Ok(seq)
    }

    /// Wait until every write issued so far has been settled.
    ///
    /// Returns the error of the settling write if it was dropped.
    pub async fn flush(&self) -> Result<()> {
        let target = self.issued.load(Ordering::SeqCst);
        let mut status = self.status.clone();
        let settled = status
            .wait_for(|s| s.seq >= target)
            .await
            .map_err(|_| StorageError::QueueClosed)?;
        match &settled.error {
            Some(message) => Err(StorageError::WriteDropped(message.clone())),
            None => Ok(()),
        }
    }
}

/// Spawns the writer task for a [`DocumentStore`].
pub struct PersistQueue;

impl PersistQueue {
    pub fn spawn(
        store: Arc<dyn DocumentStore>,
        schedule: RetrySchedule,
    ) -> (PersistHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(WriteStatus::default());
        let handle = tokio::spawn(run_writer(store, schedule, rx, status_tx));
        (
            PersistHandle {
                tx,
                issued: Arc::new(AtomicU64::new(0)),
                status: status_rx,
            },
            handle,
        )
    }
}

async fn run_writer(
    store: Arc<dyn DocumentStore>,
    schedule: RetrySchedule,
    mut rx: mpsc::UnboundedReceiver<WriteRequest>,
    status: watch::Sender<WriteStatus>,
) {
    let mut last_written = 0u64;

    while let Some(mut request) = rx.recv().await {
        // Coalesce: only the newest waiting snapshot matters.
        while let Ok(next) = rx.try_recv() {
            if next.seq > request.seq {
                request = next;
            }
        }
        if request.seq <= last_written {
            continue;
        }

        let error = write_with_retry(store.as_ref(), &request.document, &schedule)
            .await
            .err()
            .map(|e| e.to_string());
        last_written = request.seq;
        status.send_replace(WriteStatus {
            seq: request.seq,
            error,
        });
    }

    debug!(backend = store.backend(), "Persist queue closed");
}

async fn write_with_retry(
    store: &dyn DocumentStore,
    document: &serde_json::Value,
    schedule: &RetrySchedule,
) -> Result<()> {
    let mut attempt = 0usize;
    loop {
        let result = match tokio::time::timeout(schedule.attempt_timeout, store.save(document))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout),
        };

        let Err(e) = result else {
            return Ok(());
        };

        match schedule.delays.get(attempt) {
            Some(delay) => {
                warn!(
                    backend = store.backend(),
                    attempt = attempt + 1,
                    "Store write failed, retrying in {delay:?}: {e}"
                );
                tokio::time::sleep(*delay).await;
                attempt += 1;
            }
            None => {
                error!(
                    backend = store.backend(),
                    attempts = attempt + 1,
                    "Store write dropped, in-memory state is ahead of the store: {e}"
                );
                return Err(e);
            }
        }
    }
}
