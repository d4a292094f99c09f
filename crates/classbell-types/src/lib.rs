use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ──────────────────── Delivery Targets ────────────────────

/// Destination of an announcement: a group chat plus an optional forum topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    /// Group chat id on the chat platform.
    pub chat_id: i64,
    /// Forum topic (sub-channel) inside the group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<i64>,
}

impl Target {
    pub fn group(chat_id: i64) -> Self {
        Self {
            chat_id,
            topic_id: None,
        }
    }

    pub fn with_topic(self, topic_id: Option<i64>) -> Self {
        Self { topic_id, ..self }
    }
}

// ──────────────────── Occurrences ────────────────────

/// How the announcement text is produced at fire time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RenderMode {
    /// Ask the AI renderer, fall back to a fixed template.
    Ai,
    /// Use the admin-supplied text verbatim.
    Manual,
}

/// Announcement content carried by an occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccurrencePayload {
    pub batch_id: String,
    pub subject_id: String,
    /// Class start time as shown to members ("10:00").
    pub display_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_text: Option<String>,
    pub render_mode: RenderMode,
    /// Minutes between the notification and the class start.
    #[serde(default)]
    pub notify_offset_minutes: u32,
    /// Failed delivery attempts so far.
    #[serde(default)]
    pub retry_count: u32,
}

/// One concrete, scheduled firing of a class announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occurrence {
    /// Unique id; a reschedule or retry always issues a new one.
    pub id: String,
    /// Id of the first occurrence in a retry/edit chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
    /// Moment the notification is due (offset already applied).
    pub fire_at: DateTime<Utc>,
    pub target: Target,
    pub payload: OccurrencePayload,
    pub created_at: DateTime<Utc>,
}

impl Occurrence {
    /// Moment the class itself starts.
    pub fn class_start(&self) -> DateTime<Utc> {
        self.fire_at + chrono::Duration::minutes(i64::from(self.payload.notify_offset_minutes))
    }

    /// Id of the chain this occurrence belongs to.
    pub fn lineage(&self) -> &str {
        self.origin_id.as_deref().unwrap_or(&self.id)
    }
}

// ──────────────────── Attendance ────────────────────

/// Attendance sheet for one delivered occurrence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    /// When the sheet was opened (delivery time, or first mark).
    pub opened_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    #[serde(default)]
    pub attendees: Vec<String>,
}

// ──────────────────── Document ────────────────────

/// Linked group and its display name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Target>,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub at: DateTime<Utc>,
    pub from: String,
    pub text: String,
}

/// Observational counters; nothing reads them for correctness.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub classes_scheduled: u64,
    #[serde(default)]
    pub ai_requests: u64,
}

/// The single JSON document kept in the durable store.
///
/// Every field defaults, so older or hand-edited exports load cleanly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreDocument {
    pub config: GroupConfig,
    /// Batch id → subject names.
    pub subjects: BTreeMap<String, Vec<String>>,
    pub occurrences: Vec<Occurrence>,
    /// Occurrence id → attendance sheet.
    pub attendance: BTreeMap<String, AttendanceRecord>,
    pub feedback: Vec<FeedbackEntry>,
    pub stats: SystemStats,
    /// Topic id → display name.
    pub topics: BTreeMap<i64, String>,
    pub admins: Vec<String>,
}

impl StoreDocument {
    /// Parse a document, filling any missing keys with defaults.
    pub fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value)
    }

    /// Parse a document, parsing occurrences one by one so a malformed entry
    /// only costs that entry. Rejected entries come back as errors.
    pub fn from_value_lenient(
        mut value: serde_json::Value,
    ) -> Result<(Self, Vec<serde_json::Error>), serde_json::Error> {
        let raw_occurrences = value
            .as_object_mut()
            .and_then(|fields| fields.remove("occurrences"));
        let mut document = Self::from_value(value)?;
        let mut rejected = Vec::new();

        if let Some(serde_json::Value::Array(items)) = raw_occurrences {
            for item in items {
                match serde_json::from_value::<Occurrence>(item) {
                    Ok(occurrence) => document.occurrences.push(occurrence),
                    Err(e) => rejected.push(e),
                }
            }
        }
        Ok((document, rejected))
    }

    /// Register a subject under a batch; returns true if it was new.
    pub fn register_subject(&mut self, batch_id: &str, subject_id: &str) -> bool {
        let subjects = self.subjects.entry(batch_id.to_string()).or_default();
        if subjects.iter().any(|s| s == subject_id) {
            return false;
        }
        subjects.push(subject_id.to_string());
        true
    }
}

// ──────────────────── AI Extraction ────────────────────

/// One class row read from a timetable photo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimetableEntry {
    /// Short weekday name ("Mon").
    pub day: String,
    /// 24h "HH:MM".
    pub time: String,
    pub subject: String,
    pub batch: String,
}
