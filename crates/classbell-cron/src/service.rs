//! High-level scheduling operations used by the bot and the CLI.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use futures::FutureExt;
use tracing::{error, info, warn};

use classbell_types::{FeedbackEntry, Occurrence, SystemStats, Target, TimetableEntry};

use crate::attendance::AttendanceBook;
use crate::bulk_edit::BulkEditResolver;
use crate::db::{Database, StoreError};
use crate::delivery::{DeliveryExecutor, SendRequest, TextFormat};
use crate::recovery::{RecoveryCoordinator, RecoveryReport};
use crate::recurrence::{RecurrenceSpec, build_occurrences};
use crate::scheduler::{DailyHandler, Scheduler};
use crate::store::OccurrenceStore;
use crate::summary::next_day_summary;

const MAINTENANCE_JOB: &str = "daily:maintenance";
const SUMMARY_JOB: &str = "daily:summary";

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("no group linked yet, run /start in the class group first")]
    NoTarget,
    #[error("no weekdays selected")]
    NoDays,
    #[error("the date range contains none of the selected weekdays")]
    EmptyRange,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Retention windows applied by daily maintenance.
#[derive(Debug, Clone, Copy)]
pub struct MaintenancePolicy {
    pub stale_after: Duration,
    pub attendance_retention: Duration,
}

impl Default for MaintenancePolicy {
    fn default() -> Self {
        Self {
            stale_after: Duration::hours(24),
            attendance_retention: Duration::days(30),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub stale_purged: usize,
    pub sheets_purged: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimetableImport {
    pub scheduled: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub group: Option<Target>,
    pub group_name: String,
    pub pending: usize,
    pub timers: usize,
    pub next_fire: Option<DateTime<Utc>>,
    pub stats: SystemStats,
}

pub struct ScheduleService {
    db: Arc<Database>,
    store: OccurrenceStore,
    attendance: AttendanceBook,
    executor: Arc<DeliveryExecutor>,
}

impl ScheduleService {
    pub fn new(db: Arc<Database>, executor: Arc<DeliveryExecutor>) -> Self {
        Self {
            store: OccurrenceStore::new(db.clone()),
            attendance: AttendanceBook::new(db.clone()),
            db,
            executor,
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn store(&self) -> &OccurrenceStore {
        &self.store
    }

    pub fn attendance(&self) -> &AttendanceBook {
        &self.attendance
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        self.executor.scheduler()
    }

    /// Expand, store and arm a recurrence rule for the linked group.
    pub async fn schedule(
        &self,
        spec: &RecurrenceSpec,
        now: DateTime<Utc>,
    ) -> Result<Vec<Occurrence>, ScheduleError> {
        if spec.days_of_week.is_empty() {
            return Err(ScheduleError::NoDays);
        }
        let group = self
            .db
            .read(|doc| doc.config.target)
            .await
            .ok_or(ScheduleError::NoTarget)?;

        let occurrences = build_occurrences(spec, group, self.executor.policy().tz, now);
        if occurrences.is_empty() {
            return Err(ScheduleError::EmptyRange);
        }

        let count = occurrences.len() as u64;
        self.db
            .update(|doc| {
                doc.register_subject(&spec.batch_id, &spec.subject_id);
                doc.stats.classes_scheduled += count;
                ((), true)
            })
            .await?;
        self.store.add_all(occurrences.clone()).await?;
        for occ in &occurrences {
            self.executor.arm(occ);
        }

        info!(
            batch = %spec.batch_id,
            subject = %spec.subject_id,
            count,
            "Scheduled classes"
        );
        Ok(occurrences)
    }

    /// Schedule one weekly class per timetable row, starting tomorrow.
    pub async fn import_timetable(
        &self,
        entries: &[TimetableEntry],
        now: DateTime<Utc>,
    ) -> Result<TimetableImport, ScheduleError> {
        let tomorrow = now.with_timezone(&self.executor.policy().tz).date_naive() + Duration::days(1);
        let mut report = TimetableImport::default();

        for entry in entries {
            let Some(spec) = RecurrenceSpec::from_timetable(entry, tomorrow) else {
                warn!(?entry, "Skipping unreadable timetable row");
                report.skipped += 1;
                continue;
            };
            report.scheduled += self.schedule(&spec, now).await?.len();
        }
        Ok(report)
    }

    /// Delete a pending occurrence.
    pub async fn cancel(&self, id: &str) -> Result<bool, StoreError> {
        let cancelled = self.scheduler().cancel(id);
        let removed = self.store.remove(id).await?;
        Ok(cancelled || removed)
    }

    /// Pending occurrences, soonest first.
    pub async fn agenda(&self) -> Vec<Occurrence> {
        let mut occurrences = self.store.list().await;
        occurrences.sort_by(|a, b| a.fire_at.cmp(&b.fire_at));
        occurrences
    }

    /// Make `group` the announcement target and move pending occurrences to it.
    pub async fn link_group(&self, group: Target, display_name: &str) -> Result<usize, StoreError> {
        let group = group.with_topic(None);
        self.db
            .update(|doc| {
                doc.config.target = Some(group);
                doc.config.display_name = display_name.to_string();
                ((), true)
            })
            .await?;
        let moved = self.store.update_target(group).await?;
        info!(chat_id = group.chat_id, moved, "Group linked");
        Ok(moved)
    }

    pub async fn recover(&self, now: DateTime<Utc>) -> Result<RecoveryReport, StoreError> {
        RecoveryCoordinator::new(self.store.clone(), self.executor.clone())
            .recover(now)
            .await
    }

    pub fn bulk_edit(&self) -> BulkEditResolver {
        BulkEditResolver::new(self.store.clone(), self.executor.clone())
    }

    pub async fn record_feedback(
        &self,
        from: &str,
        text: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.db
            .update(|doc| {
                doc.feedback.push(FeedbackEntry {
                    at,
                    from: from.to_string(),
                    text: text.to_string(),
                });
                ((), true)
            })
            .await
    }

    /// Add a subject to a batch's registry. Returns false if it was known.
    pub async fn add_subject(&self, batch_id: &str, subject_id: &str) -> Result<bool, StoreError> {
        let added = self
            .db
            .update(|doc| {
                let added = doc.register_subject(batch_id, subject_id);
                (added, added)
            })
            .await?;
        if added {
            info!(batch = batch_id, subject = subject_id, "Subject registered");
        }
        Ok(added)
    }

    pub async fn record_ai_request(&self) -> Result<(), StoreError> {
        self.db
            .update(|doc| {
                doc.stats.ai_requests += 1;
                ((), true)
            })
            .await
    }

    pub async fn mark_started(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.db
            .update(|doc| {
                doc.stats.started_at = Some(at);
                ((), true)
            })
            .await
    }

    /// Purge long-missed occurrences and old attendance sheets.
    pub async fn run_maintenance(
        &self,
        now: DateTime<Utc>,
        policy: &MaintenancePolicy,
    ) -> Result<MaintenanceReport, StoreError> {
        let stale = self.store.purge_stale(now, policy.stale_after).await?;
        for id in &stale {
            self.scheduler().cancel(id);
        }
        let sheets_purged = self
            .attendance
            .purge_older_than(now, policy.attendance_retention)
            .await?;

        let report = MaintenanceReport {
            stale_purged: stale.len(),
            sheets_purged,
        };
        info!(
            stale = report.stale_purged,
            sheets = report.sheets_purged,
            "Maintenance finished"
        );
        Ok(report)
    }

    /// Post tomorrow's classes to the linked group. Returns false when there
    /// was nothing to send.
    pub async fn send_summary(&self, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let Some(group) = self.db.read(|doc| doc.config.target).await else {
            return Ok(false);
        };
        let today = now.with_timezone(&self.executor.policy().tz).date_naive();
        let occurrences = self.store.list().await;
        let Some(text) = next_day_summary(&occurrences, today, self.executor.policy().tz) else {
            return Ok(false);
        };

        self.executor
            .transport()
            .send(&SendRequest {
                chat_id: group.chat_id,
                topic_id: None,
                text,
                format: TextFormat::Html,
                actions: Vec::new(),
            })
            .await?;
        Ok(true)
    }

    /// Register daily maintenance and, when `summary_at` is set, the evening
    /// summary.
    pub fn start_daily_jobs(
        self: &Arc<Self>,
        maintenance_at: NaiveTime,
        summary_at: Option<NaiveTime>,
        policy: MaintenancePolicy,
    ) {
        let service = Arc::clone(self);
        let maintenance: DailyHandler = Arc::new(move || {
            let service = service.clone();
            async move {
                if let Err(e) = service.run_maintenance(Utc::now(), &policy).await {
                    error!("Maintenance failed: {e}");
                }
            }
            .boxed()
        });
        self.scheduler()
            .register_daily(maintenance_at, MAINTENANCE_JOB, maintenance);

        if let Some(at) = summary_at {
            let service = Arc::clone(self);
            let summary: DailyHandler = Arc::new(move || {
                let service = service.clone();
                async move {
                    if let Err(e) = service.send_summary(Utc::now()).await {
                        warn!("Daily summary not sent: {e}");
                    }
                }
                .boxed()
            });
            self.scheduler().register_daily(at, SUMMARY_JOB, summary);
        }
    }

    pub async fn status(&self) -> ServiceStatus {
        let (group, group_name, stats) = self
            .db
            .read(|doc| {
                (
                    doc.config.target,
                    doc.config.display_name.clone(),
                    doc.stats.clone(),
                )
            })
            .await;
        let agenda = self.agenda().await;
        ServiceStatus {
            group,
            group_name,
            pending: agenda.len(),
            timers: self.scheduler().list_pending().len(),
            next_fire: agenda.first().map(|o| o.fire_at),
            stats,
        }
    }
}
