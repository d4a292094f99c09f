//! Test doubles shared by the module tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use classbell_storage::{MemoryDocumentStore, RetrySchedule};
use classbell_types::{Occurrence, OccurrencePayload, RenderMode, Target};

use crate::db::Database;
use crate::delivery::{
    AnnouncementRenderer, AnnouncementRequest, ChatTransport, DeliveryExecutor, DeliveryPolicy,
    MessageHandle, SendError, SendRequest,
};
use crate::scheduler::Scheduler;

pub const GROUP: i64 = -100_200_300;

pub async fn memory_db() -> (Arc<Database>, Arc<MemoryDocumentStore>) {
    let backing = Arc::new(MemoryDocumentStore::new());
    let db = Database::open(backing.clone(), RetrySchedule::default())
        .await
        .unwrap();
    (db, backing)
}

/// A CSDA Maths class announced at `fire_at`.
pub fn occurrence_at(id: &str, fire_at: DateTime<Utc>) -> Occurrence {
    Occurrence {
        id: id.to_string(),
        origin_id: None,
        fire_at,
        target: Target::group(GROUP),
        payload: OccurrencePayload {
            batch_id: "CSDA".into(),
            subject_id: "Maths".into(),
            display_time: "10:00".into(),
            link: None,
            manual_text: None,
            render_mode: RenderMode::Ai,
            notify_offset_minutes: 0,
            retry_count: 0,
        },
        created_at: fire_at,
    }
}

pub fn fast_policy() -> DeliveryPolicy {
    DeliveryPolicy {
        max_retries: 3,
        retry_delay: Duration::from_secs(1),
        retry_jitter: Duration::ZERO,
        render_timeout: Duration::from_secs(5),
        send_timeout: Duration::from_secs(5),
        tz: chrono_tz::UTC,
    }
}

pub async fn executor_with(
    transport: Arc<FakeTransport>,
    renderer: Option<Arc<FakeRenderer>>,
    policy: DeliveryPolicy,
) -> (Arc<DeliveryExecutor>, Arc<Database>) {
    let (db, _) = memory_db().await;
    let scheduler = Arc::new(Scheduler::new(policy.tz));
    let renderer = renderer.map(|r| r as Arc<dyn AnnouncementRenderer>);
    let executor = Arc::new(DeliveryExecutor::new(
        db.clone(),
        scheduler,
        transport,
        renderer,
        policy,
    ));
    (executor, db)
}

/// Transport that replays scripted results, then falls back to a default.
pub struct FakeTransport {
    script: Mutex<VecDeque<Result<(), SendError>>>,
    otherwise: Result<(), SendError>,
    hang: bool,
    sent: Mutex<Vec<SendRequest>>,
    next_message_id: AtomicI64,
}

impl FakeTransport {
    fn build(
        script: Vec<Result<(), SendError>>,
        otherwise: Result<(), SendError>,
        hang: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            otherwise,
            hang,
            sent: Mutex::new(Vec::new()),
            next_message_id: AtomicI64::new(1),
        })
    }

    pub fn succeeding() -> Arc<Self> {
        Self::build(Vec::new(), Ok(()), false)
    }

    /// Fail with each scripted error in turn, then succeed.
    pub fn scripted(errors: Vec<Result<(), SendError>>) -> Arc<Self> {
        Self::build(errors, Ok(()), false)
    }

    pub fn failing(error: SendError) -> Arc<Self> {
        Self::build(Vec::new(), Err(error), false)
    }

    /// Record each request and never answer.
    pub fn hanging() -> Arc<Self> {
        Self::build(Vec::new(), Ok(()), true)
    }

    pub fn sent(&self) -> Vec<SendRequest> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatTransport for FakeTransport {
    async fn send(&self, request: &SendRequest) -> Result<MessageHandle, SendError> {
        self.sent.lock().unwrap().push(request.clone());
        if self.hang {
            std::future::pending::<()>().await;
        }
        let result = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.otherwise.clone());
        result.map(|()| MessageHandle {
            chat_id: request.chat_id,
            message_id: self.next_message_id.fetch_add(1, Ordering::SeqCst),
        })
    }
}

pub enum FakeRenderer {
    Reply(String),
    Fail,
    Hang,
}

impl FakeRenderer {
    pub fn replying(text: &str) -> Arc<Self> {
        Arc::new(Self::Reply(text.to_string()))
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self::Fail)
    }

    pub fn hanging() -> Arc<Self> {
        Arc::new(Self::Hang)
    }
}

#[async_trait]
impl AnnouncementRenderer for FakeRenderer {
    async fn render(&self, _request: &AnnouncementRequest) -> anyhow::Result<String> {
        match self {
            Self::Reply(text) => Ok(text.clone()),
            Self::Fail => Err(anyhow::anyhow!("quota exceeded")),
            Self::Hang => std::future::pending().await,
        }
    }
}
