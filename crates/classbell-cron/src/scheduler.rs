//! In-memory timer wheel for occurrences and daily jobs.
//!
//! Each registration is a tokio task sleeping until its fire time. Ids are
//! unique: registering an id again aborts the earlier task first. A one-shot
//! task claims (removes) its entry right before running its job, so once a
//! job has started `cancel` no longer sees it and cannot interrupt it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, NaiveTime, Utc};
use chrono_tz::Tz;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::recurrence::local_to_utc;

/// Factory for the future run on every tick of a daily job.
pub type DailyHandler = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Once,
    Daily,
}

/// A registration waiting for its next fire time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingJob {
    pub id: String,
    pub fire_at: DateTime<Utc>,
    pub kind: JobKind,
}

struct Registration {
    serial: u64,
    fire_at: DateTime<Utc>,
    kind: JobKind,
    handle: JoinHandle<()>,
}

type Registry = Arc<Mutex<HashMap<String, Registration>>>;

pub struct Scheduler {
    tz: Tz,
    jobs: Registry,
    next_serial: AtomicU64,
}

impl Scheduler {
    pub fn new(tz: Tz) -> Self {
        Self {
            tz,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            next_serial: AtomicU64::new(1),
        }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Run `job` at `fire_at`, or right away if that moment has passed.
    pub fn register_once(&self, fire_at: DateTime<Utc>, id: &str, job: BoxFuture<'static, ()>) {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let jobs = self.jobs.clone();
        let key = id.to_string();

        // The task's claim waits on this lock, so it cannot run before the
        // entry is in place.
        let mut guard = lock(&self.jobs);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(until(fire_at)).await;
            if claim(&jobs, &key, serial) {
                job.await;
            }
        });
        let previous = guard.insert(
            id.to_string(),
            Registration {
                serial,
                fire_at,
                kind: JobKind::Once,
                handle,
            },
        );
        drop(guard);

        if let Some(previous) = previous {
            previous.handle.abort();
            debug!(job_id = %id, "Superseded earlier registration");
        }
        debug!(job_id = %id, %fire_at, "Registered one-shot job");
    }

    /// Run `handler` every day at `time` (in the scheduler's zone) until
    /// cancelled. A second registration under the same id replaces the first.
    pub fn register_daily(&self, time: NaiveTime, id: &str, handler: DailyHandler) {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let jobs = self.jobs.clone();
        let key = id.to_string();
        let tz = self.tz;
        let first = next_daily_fire(time, tz, Utc::now());

        let mut guard = lock(&self.jobs);
        let handle = tokio::spawn(async move {
            let mut next = first;
            loop {
                tokio::time::sleep(until(next)).await;
                if !still_registered(&jobs, &key, serial) {
                    break;
                }
                debug!(job_id = %key, "Daily job firing");
                tokio::spawn(handler());

                next = next_daily_fire(time, tz, next.max(Utc::now()));
                if let Some(reg) = lock(&jobs).get_mut(&key).filter(|r| r.serial == serial) {
                    reg.fire_at = next;
                }
            }
        });
        let previous = guard.insert(
            id.to_string(),
            Registration {
                serial,
                fire_at: first,
                kind: JobKind::Daily,
                handle,
            },
        );
        drop(guard);

        if let Some(previous) = previous {
            previous.handle.abort();
        }
        info!(job_id = %id, %time, "Registered daily job");
    }

    /// Cancel a registration that has not started. Returns whether one was
    /// found.
    pub fn cancel(&self, id: &str) -> bool {
        let removed = lock(&self.jobs).remove(id);
        match removed {
            Some(reg) => {
                reg.handle.abort();
                debug!(job_id = %id, "Cancelled job");
                true
            }
            None => false,
        }
    }

    /// Cancel every pending one-shot job, leaving daily jobs running.
    pub fn cancel_all_once(&self) -> usize {
        let mut jobs = lock(&self.jobs);
        let ids: Vec<String> = jobs
            .iter()
            .filter(|(_, r)| r.kind == JobKind::Once)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            if let Some(reg) = jobs.remove(id) {
                reg.handle.abort();
            }
        }
        ids.len()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        lock(&self.jobs).contains_key(id)
    }

    /// Pending registrations ordered by fire time.
    pub fn list_pending(&self) -> Vec<PendingJob> {
        let mut pending: Vec<PendingJob> = lock(&self.jobs)
            .iter()
            .map(|(id, r)| PendingJob {
                id: id.clone(),
                fire_at: r.fire_at,
                kind: r.kind,
            })
            .collect();
        pending.sort_by(|a, b| a.fire_at.cmp(&b.fire_at).then_with(|| a.id.cmp(&b.id)));
        pending
    }

    /// Abort everything.
    pub fn shutdown(&self) {
        let drained: Vec<Registration> = lock(&self.jobs).drain().map(|(_, r)| r).collect();
        for reg in drained {
            reg.handle.abort();
        }
        info!("Scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for reg in lock(&self.jobs).values() {
            reg.handle.abort();
        }
    }
}

/// Next moment strictly after `after` at which the wall clock in `tz` reads `time`.
pub fn next_daily_fire(time: NaiveTime, tz: Tz, after: DateTime<Utc>) -> DateTime<Utc> {
    let mut date = after.with_timezone(&tz).date_naive();
    loop {
        let candidate = local_to_utc(date.and_time(time), tz);
        if candidate > after {
            return candidate;
        }
        date += Duration::days(1);
    }
}

fn until(at: DateTime<Utc>) -> std::time::Duration {
    (at - Utc::now()).to_std().unwrap_or_default()
}

fn lock(jobs: &Mutex<HashMap<String, Registration>>) -> MutexGuard<'_, HashMap<String, Registration>> {
    jobs.lock().unwrap_or_else(|e| e.into_inner())
}

fn claim(jobs: &Registry, id: &str, serial: u64) -> bool {
    let mut jobs = lock(jobs);
    if jobs.get(id).is_some_and(|r| r.serial == serial) {
        jobs.remove(id);
        true
    } else {
        false
    }
}

fn still_registered(jobs: &Registry, id: &str, serial: u64) -> bool {
    lock(jobs).get(id).is_some_and(|r| r.serial == serial)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;

    fn counting(counter: &Arc<AtomicUsize>) -> BoxFuture<'static, ()> {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        .boxed()
    }

    #[tokio::test(start_paused = true)]
    async fn test_once_fires_and_leaves_registry() {
        let scheduler = Scheduler::new(chrono_tz::UTC);
        let fired = Arc::new(AtomicUsize::new(0));
        scheduler.register_once(Utc::now() + Duration::minutes(30), "a", counting(&fired));
        assert!(scheduler.is_pending("a"));

        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(scheduler.list_pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_fire_time_runs_immediately() {
        let scheduler = Scheduler::new(chrono_tz::UTC);
        let fired = Arc::new(AtomicUsize::new(0));
        scheduler.register_once(Utc::now() - Duration::hours(1), "late", counting(&fired));

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_id_supersedes() {
        let scheduler = Scheduler::new(chrono_tz::UTC);
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        scheduler.register_once(Utc::now() + Duration::minutes(5), "dup", counting(&first));
        scheduler.register_once(Utc::now() + Duration::minutes(10), "dup", counting(&second));
        assert_eq!(scheduler.list_pending().len(), 1);

        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_fire() {
        let scheduler = Scheduler::new(chrono_tz::UTC);
        let fired = Arc::new(AtomicUsize::new(0));
        scheduler.register_once(Utc::now() + Duration::minutes(5), "c", counting(&fired));

        assert!(scheduler.cancel("c"));
        assert!(!scheduler.cancel("c"));
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_daily_repeats_and_survives_once_cancel() {
        let scheduler = Scheduler::new(chrono_tz::UTC);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let handler: DailyHandler = Arc::new(move || counting(&counter));
        scheduler.register_daily(NaiveTime::from_hms_opt(3, 0, 0).unwrap(), "maint", handler);

        assert_eq!(scheduler.cancel_all_once(), 0);
        let first = scheduler.list_pending()[0].fire_at;
        tokio::time::sleep(until(first) + std::time::Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let pending = scheduler.list_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, JobKind::Daily);
        assert_eq!(pending[0].fire_at, first + Duration::days(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_daily_reregistration_replaces() {
        let scheduler = Scheduler::new(chrono_tz::UTC);
        let old = Arc::new(AtomicUsize::new(0));
        let new = Arc::new(AtomicUsize::new(0));
        let (c_old, c_new) = (old.clone(), new.clone());
        let at = NaiveTime::from_hms_opt(20, 0, 0).unwrap();
        scheduler.register_daily(at, "summary", Arc::new(move || counting(&c_old)));
        scheduler.register_daily(at, "summary", Arc::new(move || counting(&c_new)));

        let first = scheduler.list_pending()[0].fire_at;
        tokio::time::sleep(until(first) + std::time::Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(old.load(Ordering::SeqCst), 0);
        assert_eq!(new.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_next_daily_fire_rolls_over() {
        let tz = chrono_tz::Asia::Kolkata;
        let at = NaiveTime::from_hms_opt(3, 0, 0).unwrap();
        // 2024-01-01 02:00 IST
        let before = Utc.with_ymd_and_hms(2023, 12, 31, 20, 30, 0).unwrap();
        assert_eq!(
            next_daily_fire(at, tz, before),
            Utc.with_ymd_and_hms(2023, 12, 31, 21, 30, 0).unwrap()
        );
        let exactly = Utc.with_ymd_and_hms(2023, 12, 31, 21, 30, 0).unwrap();
        assert_eq!(
            next_daily_fire(at, tz, exactly),
            Utc.with_ymd_and_hms(2024, 1, 1, 21, 30, 0).unwrap()
        );
    }
}
