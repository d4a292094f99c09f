//! Supabase (PostgREST) document storage.
//!
//! The document lives in `table(id int primary key, data jsonb)`; reads
//! select the row by id and writes upsert it.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::{DocumentStore, Result, StorageError};

/// Remote store reached over the Supabase REST API.
pub struct SupabaseDocumentStore {
    client: Client,
    endpoint: String,
    api_key: String,
    row_id: i64,
}

#[derive(Debug, Deserialize)]
struct Row {
    #[serde(default)]
    data: Option<serde_json::Value>,
}

impl SupabaseDocumentStore {
    pub fn new(base_url: &str, api_key: &str, table: &str, row_id: i64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/rest/v1/{table}", base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
            row_id,
        })
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        Err(StorageError::Remote {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl DocumentStore for SupabaseDocumentStore {
    fn backend(&self) -> &str {
        "supabase"
    }

    async fn load(&self) -> Result<Option<serde_json::Value>> {
        let resp = self
            .authorized(self.client.get(&self.endpoint))
            .query(&[
                ("select", "data".to_string()),
                ("id", format!("eq.{}", self.row_id)),
            ])
            .send()
            .await?;
        let rows: Vec<Row> = Self::check(resp).await?.json().await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.data)
            .filter(|data| !data.is_null()))
    }

    async fn save(&self, document: &serde_json::Value) -> Result<()> {
        let body = serde_json::json!([{ "id": self.row_id, "data": document }]);
        let resp = self
            .authorized(self.client.post(&self.endpoint))
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&body)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }
}
