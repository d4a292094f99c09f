//! LLM-written class announcements.

use std::sync::Arc;

use async_trait::async_trait;

use classbell_cron::{AnnouncementRenderer, AnnouncementRequest};

use crate::gemini::GeminiClient;
use crate::timetable::strip_fences;

/// Renders announcements through Gemini. Failures are left to the caller,
/// which falls back to its fixed template.
pub struct GeminiAnnouncer {
    client: Arc<GeminiClient>,
}

impl GeminiAnnouncer {
    pub fn new(client: Arc<GeminiClient>) -> Self {
        Self { client }
    }
}

pub fn announcement_prompt(req: &AnnouncementRequest) -> String {
    let date = req.class_date.format("%A, %d %B");
    let link = req.link.as_deref().unwrap_or("");
    let mut prompt = format!(
        "Create a short HTML notification for a class.\n\
         Info: {} | {} | {} | {date}",
        req.batch_id, req.subject_id, req.display_time
    );
    prompt.push_str(
        "\nRules: Telegram HTML only (<b>, <i>, <code>, <a href='...'>), no markdown, no code fences.",
    );
    if !link.is_empty() {
        prompt.push_str(&format!(" Include <a href='{link}'>JOIN CLASS</a>."));
    }
    prompt.push_str(" Make it exciting.");
    prompt
}

#[async_trait]
impl AnnouncementRenderer for GeminiAnnouncer {
    async fn render(&self, request: &AnnouncementRequest) -> anyhow::Result<String> {
        let text = self
            .client
            .generate_text(&announcement_prompt(request))
            .await?;
        Ok(strip_fences(&text))
    }
}
