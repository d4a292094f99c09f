//! Durable list of pending occurrences.
//!
//! Every operation mutates the shared document through [`Database::update`],
//! so writes reach the backing store whole and in issue order.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use classbell_types::{Occurrence, Target};

use crate::db::{Database, StoreError};

#[derive(Clone)]
pub struct OccurrenceStore {
    db: Arc<Database>,
}

impl OccurrenceStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert, replacing any entry with the same id.
    pub async fn add(&self, occurrence: Occurrence) -> Result<(), StoreError> {
        self.add_all(vec![occurrence]).await
    }

    /// Insert several occurrences with a single write.
    pub async fn add_all(&self, occurrences: Vec<Occurrence>) -> Result<(), StoreError> {
        if occurrences.is_empty() {
            return Ok(());
        }
        self.db
            .update(|doc| {
                for occ in occurrences {
                    doc.occurrences.retain(|o| o.id != occ.id);
                    doc.occurrences.push(occ);
                }
                ((), true)
            })
            .await
    }

    /// Remove by id. Only writes when something was removed.
    pub async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.remove_many(&[id.to_string()]).await? > 0)
    }

    pub async fn remove_many(&self, ids: &[String]) -> Result<usize, StoreError> {
        self.db
            .update(|doc| {
                let before = doc.occurrences.len();
                doc.occurrences.retain(|o| !ids.contains(&o.id));
                let removed = before - doc.occurrences.len();
                (removed, removed > 0)
            })
            .await
    }

    /// Swap `old_id` for `new` in one write. Returns false, and leaves the
    /// store untouched, if `old_id` was not present.
    pub async fn replace(&self, old_id: &str, new: Occurrence) -> Result<bool, StoreError> {
        self.db
            .update(|doc| {
                let Some(pos) = doc.occurrences.iter().position(|o| o.id == old_id) else {
                    return (false, false);
                };
                doc.occurrences.remove(pos);
                doc.occurrences.retain(|o| o.id != new.id);
                doc.occurrences.push(new);
                (true, true)
            })
            .await
    }

    /// Point every pending occurrence at `group`, keeping each one's topic.
    pub async fn update_target(&self, group: Target) -> Result<usize, StoreError> {
        self.db
            .update(|doc| {
                let mut changed = 0;
                for occ in &mut doc.occurrences {
                    let retargeted = group.with_topic(occ.target.topic_id);
                    if occ.target != retargeted {
                        occ.target = retargeted;
                        changed += 1;
                    }
                }
                (changed, changed > 0)
            })
            .await
    }

    pub async fn list(&self) -> Vec<Occurrence> {
        self.db.read(|doc| doc.occurrences.clone()).await
    }

    pub async fn get(&self, id: &str) -> Option<Occurrence> {
        self.db
            .read(|doc| doc.occurrences.iter().find(|o| o.id == id).cloned())
            .await
    }

    /// Drop occurrences whose fire time is more than `max_age` in the past.
    pub async fn purge_stale(
        &self,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> Result<Vec<String>, StoreError> {
        let cutoff = now - max_age;
        let purged = self
            .db
            .update(|doc| {
                let (stale, live): (Vec<_>, Vec<_>) = std::mem::take(&mut doc.occurrences)
                    .into_iter()
                    .partition(|o| o.fire_at < cutoff);
                doc.occurrences = live;
                let ids: Vec<String> = stale.into_iter().map(|o| o.id).collect();
                let dirty = !ids.is_empty();
                (ids, dirty)
            })
            .await?;
        debug!(count = purged.len(), "Purged stale occurrences");
        Ok(purged)
    }
}
