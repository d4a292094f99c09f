//! Shared handle over the bot document.
//!
//! All mutation goes through [`Database::update`], which snapshots the whole
//! document into the persist queue while still holding the write lock. That
//! lock is the per-process serialization point for writes.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use classbell_storage::{DocumentStore, PersistHandle, PersistQueue, RetrySchedule, StorageError};
use classbell_types::StoreDocument;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Document serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// In-memory document plus its write-behind queue.
pub struct Database {
    document: RwLock<StoreDocument>,
    persist: PersistHandle,
}

impl Database {
    pub fn new(document: StoreDocument, persist: PersistHandle) -> Self {
        Self {
            document: RwLock::new(document),
            persist,
        }
    }

    /// Load the document from `store` and start its writer task.
    ///
    /// An empty store is seeded with the default document. Malformed
    /// occurrences are dropped individually with a warning.
    pub async fn open(
        store: Arc<dyn DocumentStore>,
        schedule: RetrySchedule,
    ) -> Result<Arc<Self>, StoreError> {
        let backend = store.backend().to_string();
        let loaded = store.load().await?;
        let (persist, _writer) = PersistQueue::spawn(store, schedule);

        let db = match loaded {
            Some(value) => {
                let (document, rejected) = StoreDocument::from_value_lenient(value)?;
                for e in &rejected {
                    warn!("Dropping malformed stored occurrence: {e}");
                }
                info!(
                    backend,
                    occurrences = document.occurrences.len(),
                    "Document loaded"
                );
                Self::new(document, persist)
            }
            None => {
                info!(backend, "No stored document, initializing defaults");
                let db = Self::new(StoreDocument::default(), persist);
                db.update(|_| ((), true)).await?;
                db
            }
        };
        Ok(Arc::new(db))
    }

    /// Run `f` against the current document.
    pub async fn read<R>(&self, f: impl FnOnce(&StoreDocument) -> R) -> R {
        let document = self.document.read().await;
        f(&document)
    }

    /// Mutate the document. `f` returns its result and whether it changed
    /// anything worth persisting; dirty changes queue a full snapshot.
    pub async fn update<R>(
        &self,
        f: impl FnOnce(&mut StoreDocument) -> (R, bool),
    ) -> Result<R, StoreError> {
        let mut document = self.document.write().await;
        let (value, dirty) = f(&mut document);
        if dirty {
            let snapshot = serde_json::to_value(&*document)?;
            self.persist.enqueue(snapshot)?;
        }
        Ok(value)
    }

    /// Copy of the whole document.
    pub async fn snapshot(&self) -> StoreDocument {
        self.document.read().await.clone()
    }

    /// Replace the whole document and persist it.
    pub async fn replace(&self, document: StoreDocument) -> Result<(), StoreError> {
        self.update(|current| {
            *current = document;
            ((), true)
        })
        .await
    }

    /// Wait for every queued write to settle.
    pub async fn flush(&self) -> Result<(), StoreError> {
        Ok(self.persist.flush().await?)
    }
}
