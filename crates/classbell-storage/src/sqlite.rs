//! SQLite-backed document storage for self-hosted deployments.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::{DocumentStore, Result};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS bot_storage (
    id INTEGER PRIMARY KEY,
    data TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);";

/// Single-row SQLite store.
pub struct SqliteDocumentStore {
    conn: Arc<Mutex<Connection>>,
    row_id: i64,
}

impl SqliteDocumentStore {
    /// Open (or create) the SQLite database at the given path.
    pub fn open(path: &Path, row_id: i64) -> Result<Self> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        tracing::info!("Storage opened: {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            row_id,
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory(row_id: i64) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            row_id,
        })
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    fn backend(&self) -> &str {
        "sqlite"
    }

    async fn load(&self) -> Result<Option<serde_json::Value>> {
        let conn = self.conn.clone();
        let row_id = self.row_id;
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let raw: Option<String> = conn
                .query_row(
                    "SELECT data FROM bot_storage WHERE id = ?1",
                    rusqlite::params![row_id],
                    |row| row.get(0),
                )
                .optional()?;
            match raw {
                Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
                None => Ok(None),
            }
        })
        .await?
    }

    async fn save(&self, document: &serde_json::Value) -> Result<()> {
        let conn = self.conn.clone();
        let row_id = self.row_id;
        let data = serde_json::to_string(document)?;
        let now = chrono::Utc::now().timestamp_millis();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO bot_storage (id, data, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                    data = excluded.data,
                    updated_at = excluded.updated_at",
                rusqlite::params![row_id, data, now],
            )?;
            Ok(())
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_load_empty() {
        let store = SqliteDocumentStore::open_in_memory(1).unwrap();
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store = SqliteDocumentStore::open_in_memory(1).unwrap();
        store.save(&json!({"occurrences": [1, 2]})).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded["occurrences"], json!([1, 2]));
    }

    #[tokio::test]
    async fn test_save_replaces_whole_document() {
        let store = SqliteDocumentStore::open_in_memory(1).unwrap();
        store.save(&json!({"a": 1, "b": 2})).await.unwrap();
        store.save(&json!({"a": 3})).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, json!({"a": 3}));
    }

    #[tokio::test]
    async fn test_rows_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classbell.db");
        let first = SqliteDocumentStore::open(&path, 1).unwrap();
        first.save(&json!({"row": 1})).await.unwrap();
        drop(first);

        let second = SqliteDocumentStore::open(&path, 2).unwrap();
        assert!(second.load().await.unwrap().is_none());
        second.save(&json!({"row": 2})).await.unwrap();

        let reopened = SqliteDocumentStore::open(&path, 1).unwrap();
        assert_eq!(reopened.load().await.unwrap().unwrap(), json!({"row": 1}));
    }
}
