//! Whole-document export and import.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use classbell_types::StoreDocument;

use crate::db::{Database, StoreError};
use crate::recovery::RecoveryReport;
use crate::service::ScheduleService;

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("Invalid backup: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Occurrences dropped because they could not be parsed.
    pub rejected: usize,
    pub recovery: RecoveryReport,
}

/// Pretty-printed JSON of the whole document.
pub async fn export(db: &Database) -> Result<String, BackupError> {
    let document = db.snapshot().await;
    Ok(serde_json::to_string_pretty(&document)?)
}

/// Replace the document with `raw` and rebuild the scheduler from it.
///
/// Missing keys take their defaults. Timers of the previous document are
/// cancelled; daily jobs keep running.
pub async fn import(
    service: &ScheduleService,
    raw: &str,
    now: DateTime<Utc>,
) -> Result<ImportReport, BackupError> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    let (document, rejected) = StoreDocument::from_value_lenient(value)?;
    for e in &rejected {
        warn!("Dropping malformed occurrence from backup: {e}");
    }

    service.db().replace(document).await?;
    let cancelled = service.scheduler().cancel_all_once();
    let recovery = service.recover(now).await?;

    info!(
        cancelled,
        rejected = rejected.len(),
        restored = recovery.restored,
        "Backup imported"
    );
    Ok(ImportReport {
        rejected: rejected.len(),
        recovery,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeTransport, executor_with, fast_policy, occurrence_at};
    use chrono::Duration;
    use futures::FutureExt;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_import_replaces_state_and_rearms() {
        let (executor, db) = executor_with(FakeTransport::succeeding(), None, fast_policy()).await;
        let service = ScheduleService::new(db.clone(), executor);
        let now = Utc::now();

        let before = occurrence_at("before", now + Duration::hours(3));
        service.store().add(before.clone()).await.unwrap();
        service.scheduler().register_once(
            before.fire_at,
            &before.id,
            async {}.boxed(),
        );

        let future = serde_json::to_value(occurrence_at("imported", now + Duration::hours(5))).unwrap();
        let missed = serde_json::to_value(occurrence_at("missed", now - Duration::hours(5))).unwrap();
        let raw = json!({
            "admins": ["carol"],
            "occurrences": [future, missed, { "id": 7 }]
        })
        .to_string();

        let report = import(&service, &raw, now).await.unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(report.recovery.restored, 1);
        assert_eq!(report.recovery.discarded, 1);

        let pending: Vec<String> = service
            .scheduler()
            .list_pending()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(pending, vec!["imported".to_string()]);
        let doc = db.snapshot().await;
        assert_eq!(doc.admins, vec!["carol".to_string()]);
        assert!(doc.subjects.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_round_trips_through_import() {
        let (executor, db) = executor_with(FakeTransport::succeeding(), None, fast_policy()).await;
        let service = ScheduleService::new(db.clone(), executor);
        service
            .store()
            .add(occurrence_at("keep", Utc::now() + Duration::hours(1)))
            .await
            .unwrap();

        let raw = export(&db).await.unwrap();
        assert!(raw.contains("\"keep\""));
        import(&service, &raw, Utc::now()).await.unwrap();
        assert!(service.store().get("keep").await.is_some());
    }

    #[tokio::test]
    async fn test_rejects_invalid_json() {
        let (executor, db) = executor_with(FakeTransport::succeeding(), None, fast_policy()).await;
        let service = ScheduleService::new(db, executor);
        assert!(matches!(
            import(&service, "{not json", Utc::now()).await,
            Err(BackupError::Parse(_))
        ));
    }
}
