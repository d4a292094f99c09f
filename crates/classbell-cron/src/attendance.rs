//! Attendance sheets keyed by occurrence id.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use classbell_types::{AttendanceRecord, Occurrence};

use crate::db::{Database, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Marked { total: usize },
    AlreadyMarked,
}

#[derive(Clone)]
pub struct AttendanceBook {
    db: Arc<Database>,
}

impl AttendanceBook {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Open the sheet for a delivered occurrence.
    pub async fn open_sheet(&self, occ: &Occurrence, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.db
            .update(|doc| {
                let sheet = doc
                    .attendance
                    .entry(occ.id.clone())
                    .or_insert_with(|| AttendanceRecord {
                        opened_at: at,
                        ..AttendanceRecord::default()
                    });
                sheet.batch_id.get_or_insert_with(|| occ.payload.batch_id.clone());
                sheet
                    .subject_id
                    .get_or_insert_with(|| occ.payload.subject_id.clone());
                ((), true)
            })
            .await
    }

    /// Record `attendee` as present. Marking twice is a no-op.
    pub async fn mark(
        &self,
        occurrence_id: &str,
        attendee: &str,
        at: DateTime<Utc>,
    ) -> Result<MarkOutcome, StoreError> {
        self.db
            .update(|doc| {
                let sheet = doc
                    .attendance
                    .entry(occurrence_id.to_string())
                    .or_insert_with(|| AttendanceRecord {
                        opened_at: at,
                        ..AttendanceRecord::default()
                    });
                if sheet.attendees.iter().any(|a| a == attendee) {
                    return (MarkOutcome::AlreadyMarked, false);
                }
                sheet.attendees.push(attendee.to_string());
                (
                    MarkOutcome::Marked {
                        total: sheet.attendees.len(),
                    },
                    true,
                )
            })
            .await
    }

    /// Drop sheets opened more than `max_age` ago.
    pub async fn purge_older_than(
        &self,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> Result<usize, StoreError> {
        let cutoff = now - max_age;
        self.db
            .update(|doc| {
                let before = doc.attendance.len();
                doc.attendance.retain(|_, sheet| sheet.opened_at >= cutoff);
                let purged = before - doc.attendance.len();
                (purged, purged > 0)
            })
            .await
    }

    /// Newest sheets first.
    pub async fn recent(&self, limit: usize) -> Vec<(String, AttendanceRecord)> {
        self.db
            .read(|doc| {
                let mut sheets: Vec<_> = doc
                    .attendance
                    .iter()
                    .map(|(id, sheet)| (id.clone(), sheet.clone()))
                    .collect();
                sheets.sort_by(|a, b| b.1.opened_at.cmp(&a.1.opened_at));
                sheets.truncate(limit);
                sheets
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_db, occurrence_at};
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_mark_is_idempotent() {
        let (db, _) = memory_db().await;
        let book = AttendanceBook::new(db.clone());
        let now = Utc::now();

        assert_eq!(
            book.mark("occ", "alice", now).await.unwrap(),
            MarkOutcome::Marked { total: 1 }
        );
        assert_eq!(
            book.mark("occ", "alice", now).await.unwrap(),
            MarkOutcome::AlreadyMarked
        );
        assert_eq!(
            book.mark("occ", "bob", now).await.unwrap(),
            MarkOutcome::Marked { total: 2 }
        );
    }

    #[tokio::test]
    async fn test_open_sheet_keeps_existing_marks() {
        let (db, _) = memory_db().await;
        let book = AttendanceBook::new(db.clone());
        let occ = occurrence_at("occ", Utc::now());

        book.mark("occ", "alice", Utc::now()).await.unwrap();
        book.open_sheet(&occ, Utc::now()).await.unwrap();

        let sheet = db.read(|doc| doc.attendance["occ"].clone()).await;
        assert_eq!(sheet.attendees, vec!["alice".to_string()]);
        assert_eq!(sheet.subject_id.as_deref(), Some("Maths"));
    }

    #[tokio::test]
    async fn test_purge_and_recent() {
        let (db, _) = memory_db().await;
        let book = AttendanceBook::new(db);
        let now = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();

        book.mark("old", "a", now - Duration::days(40)).await.unwrap();
        book.mark("mid", "a", now - Duration::days(5)).await.unwrap();
        book.mark("new", "a", now - Duration::days(1)).await.unwrap();

        assert_eq!(book.purge_older_than(now, Duration::days(30)).await.unwrap(), 1);
        let recent: Vec<String> = book.recent(5).await.into_iter().map(|(id, _)| id).collect();
        assert_eq!(recent, vec!["new".to_string(), "mid".to_string()]);
    }
}
