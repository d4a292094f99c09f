//! Fire-time delivery: render, send down the fallback ladder, then either
//! remove the occurrence or schedule a retry under a fresh id.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use futures::FutureExt;
use rand::Rng;
use regex::Regex;
use tracing::{debug, error, info, warn};

use classbell_types::{Occurrence, OccurrencePayload, RenderMode};

use crate::attendance::AttendanceBook;
use crate::db::Database;
use crate::scheduler::Scheduler;
use crate::store::OccurrenceStore;

/// Callback data prefix of the "mark present" button.
pub const ATTENDANCE_ACTION_PREFIX: &str = "att:";
const ATTENDANCE_FOOTER: &str = "\n\n👇 <i>Mark attendance:</i>";
const ATTENDANCE_LABEL: &str = "🙋 I am Present";

// ──────────────────── Transport seam ────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextFormat {
    Html,
    Plain,
}

/// Inline button attached to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineAction {
    pub label: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub chat_id: i64,
    pub topic_id: Option<i64>,
    pub text: String,
    pub format: TextFormat,
    pub actions: Vec<InlineAction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHandle {
    pub chat_id: i64,
    pub message_id: i64,
}

/// Send failures, classified by which fallback can recover them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("topic not found: {0}")]
    TopicNotFound(String),
    #[error("formatting rejected: {0}")]
    Formatting(String),
    #[error("{0}")]
    Other(String),
}

/// Chat platform capable of delivering announcements.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, request: &SendRequest) -> Result<MessageHandle, SendError>;
}

// ──────────────────── Renderer seam ────────────────────

/// Fields handed to an announcement renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnouncementRequest {
    pub batch_id: String,
    pub subject_id: String,
    pub display_time: String,
    pub link: Option<String>,
    pub class_date: NaiveDate,
}

/// Produces announcement HTML, typically by asking an LLM.
#[async_trait]
pub trait AnnouncementRenderer: Send + Sync {
    async fn render(&self, request: &AnnouncementRequest) -> anyhow::Result<String>;
}

// ──────────────────── Executor ────────────────────

#[derive(Debug, Clone)]
pub struct DeliveryPolicy {
    /// Retries after the first attempt before an occurrence is abandoned.
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Upper bound of the random delay added to each retry.
    pub retry_jitter: Duration,
    pub render_timeout: Duration,
    pub send_timeout: Duration,
    pub tz: Tz,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(60),
            retry_jitter: Duration::from_secs(30),
            render_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(30),
            tz: chrono_tz::Asia::Kolkata,
        }
    }
}

/// Ladder step that ended up delivering the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rung {
    Primary,
    WithoutTopic,
    PlainText,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { rung: Rung, message: MessageHandle },
    RetryScheduled { next_id: String, attempt: u32 },
    Abandoned { attempts: u32 },
    /// The occurrence was no longer stored when its time came.
    Skipped,
}

pub struct DeliveryExecutor {
    db: Arc<Database>,
    store: OccurrenceStore,
    attendance: AttendanceBook,
    scheduler: Arc<Scheduler>,
    transport: Arc<dyn ChatTransport>,
    renderer: Option<Arc<dyn AnnouncementRenderer>>,
    policy: DeliveryPolicy,
    timers: bool,
}

impl DeliveryExecutor {
    pub fn new(
        db: Arc<Database>,
        scheduler: Arc<Scheduler>,
        transport: Arc<dyn ChatTransport>,
        renderer: Option<Arc<dyn AnnouncementRenderer>>,
        policy: DeliveryPolicy,
    ) -> Self {
        Self {
            store: OccurrenceStore::new(db.clone()),
            attendance: AttendanceBook::new(db.clone()),
            db,
            scheduler,
            transport,
            renderer,
            policy,
            timers: true,
        }
    }

    /// Executor for processes that only edit the store: `arm` becomes a
    /// no-op, so nothing fires before the process exits.
    pub fn without_timers(mut self) -> Self {
        self.timers = false;
        self
    }

    pub fn policy(&self) -> &DeliveryPolicy {
        &self.policy
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn transport(&self) -> &Arc<dyn ChatTransport> {
        &self.transport
    }

    /// Register `occ` with the scheduler so it is executed at its fire time.
    pub fn arm(self: &Arc<Self>, occ: &Occurrence) {
        if !self.timers {
            debug!(occurrence_id = %occ.id, "Timers disabled, not arming");
            return;
        }
        let executor = Arc::clone(self);
        let id = occ.id.clone();
        self.scheduler.register_once(
            occ.fire_at,
            &occ.id,
            async move {
                executor.execute(&id).await;
            }
            .boxed(),
        );
    }

    /// Deliver the stored occurrence `id`.
    pub async fn execute(self: &Arc<Self>, id: &str) -> DeliveryOutcome {
        // The stored copy is authoritative; edits and deletes win.
        let Some(occ) = self.store.get(id).await else {
            debug!(occurrence_id = %id, "Occurrence no longer stored, skipping");
            return DeliveryOutcome::Skipped;
        };

        let text = self.render(&occ).await;
        match self.send_with_fallback(&occ, text).await {
            Ok((rung, message)) => {
                if let Err(e) = self.store.remove(&occ.id).await {
                    warn!(occurrence_id = %occ.id, "Failed to remove delivered occurrence: {e}");
                }
                if let Err(e) = self.attendance.open_sheet(&occ, Utc::now()).await {
                    warn!(occurrence_id = %occ.id, "Failed to open attendance sheet: {e}");
                }
                info!(
                    occurrence_id = %occ.id,
                    chat_id = occ.target.chat_id,
                    ?rung,
                    "Announcement delivered"
                );
                DeliveryOutcome::Delivered { rung, message }
            }
            Err(e) => self.retry_or_give_up(occ, e).await,
        }
    }

    async fn render(&self, occ: &Occurrence) -> String {
        let payload = &occ.payload;
        let body = match payload.render_mode {
            RenderMode::Manual => match payload.manual_text.as_deref() {
                Some(text) if !text.trim().is_empty() => {
                    format!(
                        "{}\n⏰ {}",
                        escape_html(text),
                        escape_html(&payload.display_time)
                    )
                }
                _ => fallback_announcement(payload),
            },
            RenderMode::Ai => match self.render_ai(occ).await {
                Some(text) => text,
                None => fallback_announcement(payload),
            },
        };
        format!("{body}{ATTENDANCE_FOOTER}")
    }

    async fn render_ai(&self, occ: &Occurrence) -> Option<String> {
        let renderer = self.renderer.as_ref()?;
        if let Err(e) = self
            .db
            .update(|doc| {
                doc.stats.ai_requests += 1;
                ((), true)
            })
            .await
        {
            warn!(occurrence_id = %occ.id, "Failed to count AI request: {e}");
        }

        let request = AnnouncementRequest {
            batch_id: occ.payload.batch_id.clone(),
            subject_id: occ.payload.subject_id.clone(),
            display_time: occ.payload.display_time.clone(),
            link: occ.payload.link.clone(),
            class_date: occ.class_start().with_timezone(&self.policy.tz).date_naive(),
        };
        match tokio::time::timeout(self.policy.render_timeout, renderer.render(&request)).await {
            Ok(Ok(text)) if !text.trim().is_empty() => Some(text),
            Ok(Ok(_)) => {
                warn!(occurrence_id = %occ.id, "Renderer returned nothing, using template");
                None
            }
            Ok(Err(e)) => {
                warn!(occurrence_id = %occ.id, "Renderer failed, using template: {e}");
                None
            }
            Err(_) => {
                warn!(occurrence_id = %occ.id, "Renderer timed out, using template");
                None
            }
        }
    }

    async fn send_with_fallback(
        &self,
        occ: &Occurrence,
        text: String,
    ) -> Result<(Rung, MessageHandle), SendError> {
        let mut request = SendRequest {
            chat_id: occ.target.chat_id,
            topic_id: occ.target.topic_id,
            text,
            format: TextFormat::Html,
            actions: vec![InlineAction {
                label: ATTENDANCE_LABEL.to_string(),
                data: format!("{ATTENDANCE_ACTION_PREFIX}{}", occ.id),
            }],
        };
        let mut rung = Rung::Primary;

        loop {
            let result =
                match tokio::time::timeout(self.policy.send_timeout, self.transport.send(&request))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(SendError::Other("send timed out".into())),
                };

            match result {
                Ok(message) => return Ok((rung, message)),
                Err(SendError::TopicNotFound(reason)) if request.topic_id.is_some() => {
                    warn!(occurrence_id = %occ.id, "Topic unavailable, sending to the group: {reason}");
                    request.topic_id = None;
                    rung = Rung::WithoutTopic;
                }
                Err(SendError::Formatting(reason)) if request.format == TextFormat::Html => {
                    warn!(occurrence_id = %occ.id, "Markup rejected, sending plain text: {reason}");
                    request.text = strip_markup(&request.text);
                    request.format = TextFormat::Plain;
                    rung = Rung::PlainText;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn retry_or_give_up(self: &Arc<Self>, occ: Occurrence, cause: SendError) -> DeliveryOutcome {
        let attempts = occ.payload.retry_count + 1;
        if occ.payload.retry_count >= self.policy.max_retries {
            error!(
                occurrence_id = %occ.id,
                lineage = %occ.lineage(),
                attempts,
                "Delivery abandoned: {cause}"
            );
            if let Err(e) = self.store.remove(&occ.id).await {
                warn!(occurrence_id = %occ.id, "Failed to remove abandoned occurrence: {e}");
            }
            return DeliveryOutcome::Abandoned { attempts };
        }

        let retry = retry_of(&occ, Utc::now() + self.retry_backoff());
        match self.store.replace(&occ.id, retry.clone()).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(occurrence_id = %occ.id, "Occurrence removed during delivery, not retrying");
                return DeliveryOutcome::Skipped;
            }
            // The in-memory document already holds the retry.
            Err(e) => warn!(occurrence_id = %retry.id, "Retry not persisted: {e}"),
        }
        self.arm(&retry);

        warn!(
            occurrence_id = %occ.id,
            next_id = %retry.id,
            attempt = retry.payload.retry_count,
            fire_at = %retry.fire_at,
            "Delivery failed, retry scheduled: {cause}"
        );
        DeliveryOutcome::RetryScheduled {
            next_id: retry.id,
            attempt: retry.payload.retry_count,
        }
    }

    fn retry_backoff(&self) -> chrono::Duration {
        let jitter_ms = self.policy.retry_jitter.as_millis() as u64;
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        chrono::Duration::from_std(self.policy.retry_delay + jitter)
            .unwrap_or_else(|_| chrono::Duration::seconds(60))
    }
}

/// Next attempt of `occ`: new id, same lineage, bumped retry count.
fn retry_of(occ: &Occurrence, fire_at: DateTime<Utc>) -> Occurrence {
    let mut retry = occ.clone();
    retry.id = uuid::Uuid::new_v4().to_string();
    retry.origin_id = Some(occ.lineage().to_string());
    retry.fire_at = fire_at;
    retry.payload.retry_count += 1;
    retry
}

/// Fixed-format announcement built only from payload fields.
pub fn fallback_announcement(payload: &OccurrencePayload) -> String {
    let mut text = format!(
        "<b>🔔 {} CLASS: {}</b>\n⏰ {}",
        escape_html(&payload.batch_id),
        escape_html(&payload.subject_id),
        escape_html(&payload.display_time),
    );
    if let Some(link) = payload.link.as_deref().filter(|l| !l.is_empty()) {
        text.push_str(&format!(
            "\n🔗 <a href=\"{}\">JOIN CLASS</a>",
            escape_html(link)
        ));
    }
    text
}

pub fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

static LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?is)<a\s+[^>]*href\s*=\s*"([^"]*)"[^>]*>(.*?)</a>"#).unwrap());
static BREAK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>").unwrap());
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"</?[A-Za-z][^<>]*>").unwrap());

/// Remove HTML markup, keeping link targets and all visible text.
pub fn strip_markup(html: &str) -> String {
    let text = LINK_RE.replace_all(html, "$2 ($1)");
    let text = BREAK_RE.replace_all(&text, "\n");
    let text = TAG_RE.replace_all(&text, "");
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeRenderer, FakeTransport, executor_with, fast_policy, occurrence_at};
    use chrono::Duration as ChronoDuration;

    #[tokio::test(start_paused = true)]
    async fn test_success_removes_once_and_opens_sheet() {
        let transport = FakeTransport::succeeding();
        let (executor, db) = executor_with(transport.clone(), None, fast_policy()).await;
        let store = OccurrenceStore::new(db.clone());
        store
            .add(occurrence_at("ok", Utc::now() - ChronoDuration::seconds(1)))
            .await
            .unwrap();

        let outcome = executor.execute("ok").await;
        assert!(matches!(
            outcome,
            DeliveryOutcome::Delivered {
                rung: Rung::Primary,
                ..
            }
        ));
        assert!(store.get("ok").await.is_none());
        assert!(db.read(|doc| doc.attendance.contains_key("ok")).await);

        // A second firing finds nothing to do.
        assert_eq!(executor.execute("ok").await, DeliveryOutcome::Skipped);
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_armed_occurrence_is_sent_once() {
        let transport = FakeTransport::succeeding();
        let (executor, db) = executor_with(transport.clone(), None, fast_policy()).await;
        let occ = occurrence_at("armed", Utc::now() + ChronoDuration::minutes(1));
        OccurrenceStore::new(db).add(occ.clone()).await.unwrap();

        executor.arm(&occ);
        executor.arm(&occ);
        tokio::time::sleep(std::time::Duration::from_secs(600)).await;
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_topic_then_formatting_fallback() {
        let transport = FakeTransport::scripted(vec![
            Err(SendError::TopicNotFound("message thread not found".into())),
            Err(SendError::Formatting("can't parse entities".into())),
        ]);
        let (executor, db) = executor_with(transport.clone(), None, fast_policy()).await;
        let mut occ = occurrence_at("ladder", Utc::now());
        occ.target.topic_id = Some(44);
        occ.payload.link = Some("https://meet.example/q".into());
        OccurrenceStore::new(db).add(occ).await.unwrap();

        let outcome = executor.execute("ladder").await;
        assert!(matches!(
            outcome,
            DeliveryOutcome::Delivered {
                rung: Rung::PlainText,
                ..
            }
        ));

        let sent = transport.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].topic_id, Some(44));
        assert_eq!(sent[1].topic_id, None);
        assert_eq!(sent[2].format, TextFormat::Plain);
        assert!(sent[2].text.contains("JOIN CLASS (https://meet.example/q)"));
        assert!(!sent[2].text.contains("<b>"));
        assert_eq!(sent[2].actions[0].data, "att:ladder");
    }

    #[tokio::test(start_paused = true)]
    async fn test_topic_error_without_topic_is_retried() {
        let transport = FakeTransport::scripted(vec![Err(SendError::TopicNotFound("gone".into()))]);
        let (executor, db) = executor_with(transport.clone(), None, fast_policy()).await;
        OccurrenceStore::new(db)
            .add(occurrence_at("plain", Utc::now()))
            .await
            .unwrap();

        let outcome = executor.execute("plain").await;
        assert!(matches!(outcome, DeliveryOutcome::RetryScheduled { attempt: 1, .. }));
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_ceiling_abandons() {
        let transport = FakeTransport::failing(SendError::Other("502 Bad Gateway".into()));
        let policy = fast_policy();
        let max_retries = policy.max_retries;
        let (executor, db) = executor_with(transport.clone(), None, policy).await;
        let store = OccurrenceStore::new(db);
        let occ = occurrence_at("doomed", Utc::now() + ChronoDuration::seconds(1));
        store.add(occ.clone()).await.unwrap();
        executor.arm(&occ);

        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;

        assert_eq!(transport.sent().len(), max_retries as usize + 1);
        assert!(store.list().await.is_empty());
        assert!(executor.scheduler().list_pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_keeps_lineage() {
        let transport = FakeTransport::scripted(vec![Err(SendError::Other("timeout".into()))]);
        let (executor, db) = executor_with(transport, None, fast_policy()).await;
        let store = OccurrenceStore::new(db);
        store.add(occurrence_at("root", Utc::now())).await.unwrap();

        let DeliveryOutcome::RetryScheduled { next_id, attempt } = executor.execute("root").await
        else {
            panic!("expected a retry");
        };
        assert_eq!(attempt, 1);
        let retry = store.get(&next_id).await.unwrap();
        assert_eq!(retry.origin_id.as_deref(), Some("root"));
        assert!(store.get("root").await.is_none());
        assert!(executor.scheduler().is_pending(&next_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renderer_failure_uses_template() {
        let transport = FakeTransport::succeeding();
        let renderer = FakeRenderer::failing();
        let (executor, db) =
            executor_with(transport.clone(), Some(renderer), fast_policy()).await;
        OccurrenceStore::new(db.clone())
            .add(occurrence_at("tpl", Utc::now()))
            .await
            .unwrap();

        executor.execute("tpl").await;
        let text = &transport.sent()[0].text;
        assert!(text.starts_with("<b>🔔 CSDA CLASS: Maths</b>\n⏰ 10:00"));
        assert!(text.ends_with("Mark attendance:</i>"));
        assert_eq!(db.read(|doc| doc.stats.ai_requests).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renderer_output_and_manual_text() {
        let transport = FakeTransport::succeeding();
        let renderer = FakeRenderer::replying("<b>Maths now!</b>");
        let (executor, db) =
            executor_with(transport.clone(), Some(renderer), fast_policy()).await;
        let store = OccurrenceStore::new(db);
        store.add(occurrence_at("ai", Utc::now())).await.unwrap();
        let mut manual = occurrence_at("manual", Utc::now());
        manual.payload.render_mode = RenderMode::Manual;
        manual.payload.manual_text = Some("Bring calculators".into());
        store.add(manual).await.unwrap();

        executor.execute("ai").await;
        executor.execute("manual").await;
        let sent = transport.sent();
        assert!(sent[0].text.starts_with("<b>Maths now!</b>"));
        assert!(sent[1].text.starts_with("Bring calculators\n⏰ 10:00"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_plain_fallback_keeps_manual_text_with_angle_bracket() {
        let transport =
            FakeTransport::scripted(vec![Err(SendError::Formatting("can't parse entities".into()))]);
        let (executor, db) = executor_with(transport.clone(), None, fast_policy()).await;
        let mut occ = occurrence_at("quiz", Utc::now());
        occ.payload.render_mode = RenderMode::Manual;
        occ.payload.manual_text = Some("Quiz: pass if score < 5 marks wrong".into());
        OccurrenceStore::new(db).add(occ).await.unwrap();

        let outcome = executor.execute("quiz").await;
        assert!(matches!(
            outcome,
            DeliveryOutcome::Delivered {
                rung: Rung::PlainText,
                ..
            }
        ));
        let sent = transport.sent();
        assert!(sent[0].text.starts_with("Quiz: pass if score &lt; 5 marks wrong\n"));
        assert_eq!(
            sent[1].text,
            "Quiz: pass if score < 5 marks wrong\n⏰ 10:00\n\n👇 Mark attendance:"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_renderer_falls_back_to_template() {
        let transport = FakeTransport::succeeding();
        let (executor, db) = executor_with(
            transport.clone(),
            Some(FakeRenderer::hanging()),
            fast_policy(),
        )
        .await;
        OccurrenceStore::new(db)
            .add(occurrence_at("slow-ai", Utc::now()))
            .await
            .unwrap();

        let outcome = executor.execute("slow-ai").await;
        assert!(matches!(outcome, DeliveryOutcome::Delivered { .. }));
        assert!(
            transport.sent()[0]
                .text
                .starts_with("<b>🔔 CSDA CLASS: Maths</b>")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_send_schedules_retry() {
        let transport = FakeTransport::hanging();
        let (executor, db) = executor_with(transport.clone(), None, fast_policy()).await;
        let store = OccurrenceStore::new(db);
        store
            .add(occurrence_at("stuck", Utc::now()))
            .await
            .unwrap();

        let DeliveryOutcome::RetryScheduled { next_id, attempt } = executor.execute("stuck").await
        else {
            panic!("expected a retry");
        };
        assert_eq!(attempt, 1);
        assert_eq!(transport.sent().len(), 1);
        assert!(store.get("stuck").await.is_none());
        assert!(executor.scheduler().is_pending(&next_id));
    }

    #[test]
    fn test_strip_markup_keeps_bare_angle_brackets() {
        assert_eq!(
            strip_markup("<b>Marks</b> < 5\nretake at <i>noon</i>"),
            "Marks < 5\nretake at noon"
        );
    }

    #[test]
    fn test_strip_markup() {
        let html = "<b>Hi &amp; welcome</b><br/><a href=\"https://x.test/?a=1&amp;b=2\">Join</a>";
        assert_eq!(
            strip_markup(html),
            "Hi & welcome\nJoin (https://x.test/?a=1&b=2)"
        );
    }

    #[test]
    fn test_fallback_escapes_fields() {
        let mut occ = occurrence_at("x", Utc::now());
        occ.payload.subject_id = "R&D <lab>".into();
        let text = fallback_announcement(&occ.payload);
        assert!(text.contains("R&amp;D &lt;lab&gt;"));
        assert!(!text.contains("JOIN CLASS"));
    }
}
