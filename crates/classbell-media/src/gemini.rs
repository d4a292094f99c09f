//! Minimal Gemini `generateContent` client.

use std::time::Duration;

use anyhow::Context;
use tracing::debug;

use classbell_types::TimetableEntry;

use crate::timetable::{TIMETABLE_PROMPT, parse_timetable};

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(api_key: String, model: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build Gemini HTTP client")?;
        Ok(Self {
            api_key,
            model,
            client,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Free-text completion for `prompt`.
    pub async fn generate_text(&self, prompt: &str) -> anyhow::Result<String> {
        self.generate(serde_json::json!([{ "text": prompt }])).await
    }

    /// Ask the model to read a timetable photo.
    pub async fn extract_timetable(
        &self,
        image: &[u8],
        mime_type: &str,
    ) -> anyhow::Result<Vec<TimetableEntry>> {
        let data = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, image);
        let parts = serde_json::json!([
            { "text": TIMETABLE_PROMPT },
            { "inline_data": { "mime_type": mime_type, "data": data } }
        ]);
        let text = self.generate(parts).await?;
        parse_timetable(&text)
    }

    async fn generate(&self, parts: serde_json::Value) -> anyhow::Result<String> {
        let url = format!("{API_BASE}/models/{}:generateContent", self.model);
        let body = serde_json::json!({ "contents": [{ "role": "user", "parts": parts }] });

        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("Gemini request failed")?;

        let status = resp.status();
        let json: serde_json::Value = resp.json().await?;
        if !status.is_success() {
            let msg = json
                .pointer("/error/message")
                .and_then(|m| m.as_str())
                .unwrap_or("Unknown error");
            anyhow::bail!("Gemini API error ({status}): {msg}");
        }

        let text = response_text(&json)?;
        debug!(model = %self.model, chars = text.len(), "Gemini response");
        Ok(text)
    }
}

/// Concatenated text parts of the first candidate.
pub(crate) fn response_text(json: &serde_json::Value) -> anyhow::Result<String> {
    if let Some(reason) = json
        .pointer("/promptFeedback/blockReason")
        .and_then(|r| r.as_str())
    {
        anyhow::bail!("Prompt blocked: {reason}");
    }
    let parts = json
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
        .context("Gemini response has no candidates")?;
    Ok(parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_text_joins_parts() {
        let json = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "<b>Hello" }, { "text": "</b>" }] }
            }]
        });
        assert_eq!(response_text(&json).unwrap(), "<b>Hello</b>");
    }

    #[test]
    fn test_response_text_blocked() {
        let json = json!({ "promptFeedback": { "blockReason": "SAFETY" } });
        let err = response_text(&json).unwrap_err();
        assert!(err.to_string().contains("SAFETY"));
    }

    #[test]
    fn test_response_text_missing_candidates() {
        assert!(response_text(&json!({})).is_err());
    }
}
