//! Scoped edits of scheduled occurrences.
//!
//! An edit never mutates a scheduled occurrence in place: each match is
//! replaced by a copy with a fresh id, and the old timer is cancelled.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use tracing::{info, warn};

use classbell_types::{Occurrence, RenderMode};

use crate::db::StoreError;
use crate::delivery::DeliveryExecutor;
use crate::recurrence::{local_to_utc, parse_clock};
use crate::store::OccurrenceStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditScope {
    /// Just the reference occurrence.
    Single,
    /// Same subject and batch, same weekday.
    SameDayOfWeek,
    /// Same subject and batch, any day.
    AllForSubject,
}

impl FromStr for EditScope {
    type Err = EditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "single" | "one" => Ok(Self::Single),
            "day" | "same_day" | "weekday" => Ok(Self::SameDayOfWeek),
            "all" | "subject" => Ok(Self::AllForSubject),
            _ => Err(EditError::UnknownScope(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditField {
    /// New class start time; the notify offset is kept.
    Time(NaiveTime),
    /// New class date; the start time is kept.
    Date(NaiveDate),
    Link(Option<String>),
    /// Switches the occurrence to manual text.
    Message(String),
    Topic(Option<i64>),
}

impl EditField {
    pub fn parse(field: &str, value: &str) -> Result<Self, EditError> {
        let value = value.trim();
        let cleared = matches!(value, "" | "-" | "none");
        let invalid = |field: &'static str| EditError::InvalidValue {
            field,
            value: value.to_string(),
        };

        match field.to_ascii_lowercase().as_str() {
            "time" => NaiveTime::parse_from_str(value, "%H:%M")
                .map(Self::Time)
                .map_err(|_| invalid("time")),
            "date" => NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .map(Self::Date)
                .map_err(|_| invalid("date")),
            "link" => Ok(Self::Link((!cleared).then(|| value.to_string()))),
            "message" | "text" => {
                if value.is_empty() {
                    Err(invalid("message"))
                } else {
                    Ok(Self::Message(value.to_string()))
                }
            }
            "topic" => {
                if cleared {
                    Ok(Self::Topic(None))
                } else {
                    value
                        .parse()
                        .map(|t| Self::Topic(Some(t)))
                        .map_err(|_| invalid("topic"))
                }
            }
            other => Err(EditError::UnknownField(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EditError {
    #[error("unknown field '{0}' (time, date, link, message, topic)")]
    UnknownField(String),
    #[error("invalid {field}: '{value}'")]
    InvalidValue { field: &'static str, value: String },
    #[error("unknown scope '{0}' (single, day, all)")]
    UnknownScope(String),
    #[error("occurrence {0} not found")]
    NotFound(String),
    #[error("edited class would start in the past")]
    InPast,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Default)]
pub struct BulkEditReport {
    /// (old id, new id) pairs.
    pub applied: Vec<(String, String)>,
    pub failures: Vec<(String, EditError)>,
}

pub struct BulkEditResolver {
    store: OccurrenceStore,
    executor: Arc<DeliveryExecutor>,
}

impl BulkEditResolver {
    pub fn new(store: OccurrenceStore, executor: Arc<DeliveryExecutor>) -> Self {
        Self { store, executor }
    }

    fn tz(&self) -> Tz {
        self.executor.policy().tz
    }

    /// Occurrences covered by `scope` around `reference_id`.
    pub async fn resolve(
        &self,
        scope: EditScope,
        reference_id: &str,
    ) -> Result<Vec<Occurrence>, EditError> {
        let all = self.store.list().await;
        let reference = all
            .iter()
            .find(|o| o.id == reference_id)
            .cloned()
            .ok_or_else(|| EditError::NotFound(reference_id.to_string()))?;
        Ok(resolve_in(&all, &reference, scope, self.tz()))
    }

    /// Replace every matched occurrence with an edited copy. Failures are
    /// collected per occurrence and do not stop the rest.
    pub async fn apply(
        &self,
        matched: Vec<Occurrence>,
        field: &EditField,
        now: DateTime<Utc>,
    ) -> BulkEditReport {
        let mut report = BulkEditReport::default();
        let scheduler = self.executor.scheduler();

        for old in matched {
            let edited = edit(&old, field, self.tz(), now);
            if edited.fire_at < now {
                report.failures.push((old.id, EditError::InPast));
                continue;
            }

            scheduler.cancel(&old.id);
            match self.store.replace(&old.id, edited.clone()).await {
                Ok(true) => {
                    self.executor.arm(&edited);
                    report.applied.push((old.id, edited.id));
                }
                Ok(false) => {
                    report.failures.push((old.id.clone(), EditError::NotFound(old.id)));
                }
                Err(e) => {
                    warn!(occurrence_id = %old.id, "Edit not persisted: {e}");
                    // Keep whichever version the document holds armed.
                    for id in [&edited.id, &old.id] {
                        if let Some(stored) = self.store.get(id).await {
                            self.executor.arm(&stored);
                        }
                    }
                    report.failures.push((old.id, EditError::Store(e)));
                }
            }
        }

        info!(
            applied = report.applied.len(),
            failed = report.failures.len(),
            "Bulk edit finished"
        );
        report
    }
}

/// Select from `all` the occurrences that `scope` covers for `reference`.
pub fn resolve_in(
    all: &[Occurrence],
    reference: &Occurrence,
    scope: EditScope,
    tz: Tz,
) -> Vec<Occurrence> {
    let weekday = |o: &Occurrence| o.fire_at.with_timezone(&tz).weekday();
    let same_class = |o: &Occurrence| {
        o.payload.subject_id == reference.payload.subject_id
            && o.payload.batch_id == reference.payload.batch_id
    };

    all.iter()
        .filter(|o| match scope {
            EditScope::Single => o.id == reference.id,
            EditScope::SameDayOfWeek => same_class(o) && weekday(o) == weekday(reference),
            EditScope::AllForSubject => same_class(o),
        })
        .cloned()
        .collect()
}

fn edit(old: &Occurrence, field: &EditField, tz: Tz, now: DateTime<Utc>) -> Occurrence {
    let mut new = old.clone();
    new.id = uuid::Uuid::new_v4().to_string();
    new.origin_id = Some(old.lineage().to_string());
    new.created_at = now;
    new.payload.retry_count = 0;

    let offset = chrono::Duration::minutes(i64::from(old.payload.notify_offset_minutes));
    let mut local_start = old.class_start().with_timezone(&tz).naive_local();
    // A retry fires at a jittered moment; the class clock time is in the payload.
    if old.payload.retry_count > 0 {
        if let Some(time) = parse_clock(&old.payload.display_time) {
            local_start = local_start.date().and_time(time);
        }
    }

    match field {
        EditField::Time(time) => {
            new.fire_at = local_to_utc(local_start.date().and_time(*time), tz) - offset;
            new.payload.display_time = time.format("%H:%M").to_string();
        }
        EditField::Date(date) => {
            new.fire_at = local_to_utc(date.and_time(local_start.time()), tz) - offset;
        }
        EditField::Link(link) => new.payload.link = link.clone(),
        EditField::Message(text) => {
            new.payload.manual_text = Some(text.clone());
            new.payload.render_mode = RenderMode::Manual;
        }
        EditField::Topic(topic) => new.target.topic_id = *topic,
    }
    new
}
