//! Rebuild scheduler state from the occurrence store.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use classbell_types::Occurrence;

use crate::db::StoreError;
use crate::delivery::DeliveryExecutor;
use crate::scheduler::JobKind;
use crate::store::OccurrenceStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Re-registered with the scheduler.
    pub restored: usize,
    /// Past due, removed without firing.
    pub discarded: usize,
    /// Invalid, removed with a warning.
    pub skipped: usize,
    /// Scheduler registrations with no stored occurrence.
    pub orphans_cancelled: usize,
}

pub struct RecoveryCoordinator {
    store: OccurrenceStore,
    executor: Arc<DeliveryExecutor>,
}

impl RecoveryCoordinator {
    pub fn new(store: OccurrenceStore, executor: Arc<DeliveryExecutor>) -> Self {
        Self { store, executor }
    }

    /// Make the scheduler mirror the store as of `now`.
    ///
    /// Past-due occurrences are dropped rather than sent late. Running this
    /// again is harmless: re-registering an id replaces the earlier timer.
    pub async fn recover(&self, now: DateTime<Utc>) -> Result<RecoveryReport, StoreError> {
        let mut report = RecoveryReport::default();
        let mut dropped = Vec::new();
        let mut live = Vec::new();

        for occ in self.store.list().await {
            if let Err(reason) = validate(&occ) {
                warn!(occurrence_id = %occ.id, "Skipping stored occurrence: {reason}");
                report.skipped += 1;
                dropped.push(occ.id);
            } else if occ.fire_at < now {
                info!(occurrence_id = %occ.id, fire_at = %occ.fire_at, "Discarding missed occurrence");
                report.discarded += 1;
                dropped.push(occ.id);
            } else {
                live.push(occ);
            }
        }

        if !dropped.is_empty() {
            self.store.remove_many(&dropped).await?;
        }

        let scheduler = self.executor.scheduler();
        let live_ids: HashSet<&str> = live.iter().map(|o| o.id.as_str()).collect();
        for job in scheduler.list_pending() {
            if job.kind == JobKind::Once
                && !live_ids.contains(job.id.as_str())
                && scheduler.cancel(&job.id)
            {
                report.orphans_cancelled += 1;
            }
        }

        for occ in &live {
            self.executor.arm(occ);
        }
        report.restored = live.len();

        info!(
            restored = report.restored,
            discarded = report.discarded,
            skipped = report.skipped,
            orphans = report.orphans_cancelled,
            "Recovery complete"
        );
        Ok(report)
    }
}

fn validate(occ: &Occurrence) -> Result<(), &'static str> {
    if occ.id.trim().is_empty() {
        return Err("empty id");
    }
    if occ.target.chat_id == 0 {
        return Err("no target chat");
    }
    if occ.payload.subject_id.trim().is_empty() {
        return Err("no subject");
    }
    Ok(())
}
