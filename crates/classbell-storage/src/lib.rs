//! classbell-storage: durable home of the bot document.
//!
//! The whole bot state is one JSON document stored under a single id.
//! Backends only know how to load and save that blob; ordering and retry
//! of writes live in [`queue::PersistQueue`].

pub mod memory;
pub mod queue;
pub mod sqlite;
pub mod supabase;

use async_trait::async_trait;

pub use memory::MemoryDocumentStore;
pub use queue::{PersistHandle, PersistQueue, RetrySchedule};
pub use sqlite::SqliteDocumentStore;
pub use supabase::SupabaseDocumentStore;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Blocking task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Remote store rejected request ({status}): {message}")]
    Remote { status: u16, message: String },
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Store write timed out")]
    Timeout,
    #[error("Persist queue closed")]
    QueueClosed,
    #[error("Write dropped after retries: {0}")]
    WriteDropped(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// A key-value store holding exactly one JSON document.
///
/// Implementations are last-write-wins at the document level: `save` replaces
/// the whole blob. There are no transactions.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Backend name for logs.
    fn backend(&self) -> &str;

    /// Read the document, `None` if it was never written.
    async fn load(&self) -> Result<Option<serde_json::Value>>;

    /// Replace the document.
    async fn save(&self, document: &serde_json::Value) -> Result<()>;
}
