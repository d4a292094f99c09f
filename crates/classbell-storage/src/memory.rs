//! In-process document store, used by the `memory` backend and by tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::{DocumentStore, Result, StorageError};

/// Keeps the document in memory. Failures can be injected to exercise
/// retry paths.
#[derive(Default)]
pub struct MemoryDocumentStore {
    document: Mutex<Option<serde_json::Value>>,
    fail_next_saves: AtomicU32,
    hang_next_saves: AtomicU32,
    saves: AtomicUsize,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with an existing document.
    pub fn with_document(document: serde_json::Value) -> Self {
        Self {
            document: Mutex::new(Some(document)),
            ..Self::default()
        }
    }

    /// Make the next `count` saves fail with [`StorageError::Unavailable`].
    pub fn fail_next_saves(&self, count: u32) {
        self.fail_next_saves.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` saves never complete.
    pub fn hang_next_saves(&self, count: u32) {
        self.hang_next_saves.store(count, Ordering::SeqCst);
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Current document, if any.
    pub fn snapshot(&self) -> Option<serde_json::Value> {
        self.document
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn backend(&self) -> &str {
        "memory"
    }

    async fn load(&self) -> Result<Option<serde_json::Value>> {
        Ok(self.snapshot())
    }

    async fn save(&self, document: &serde_json::Value) -> Result<()> {
        if take_one(&self.hang_next_saves) {
            std::future::pending::<()>().await;
        }
        if take_one(&self.fail_next_saves) {
            return Err(StorageError::Unavailable("injected failure".into()));
        }
        *self.document.lock().unwrap_or_else(|e| e.into_inner()) = Some(document.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = MemoryDocumentStore::new();
        store.fail_next_saves(2);
        assert!(store.save(&json!({"n": 1})).await.is_err());
        assert!(store.save(&json!({"n": 2})).await.is_err());
        store.save(&json!({"n": 3})).await.unwrap();
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.load().await.unwrap(), Some(json!({"n": 3})));
    }
}
