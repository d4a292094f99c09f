use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use classbell_config::{ClassBellConfig, StorageBackend, StorageConfig};
use classbell_cron::service::MaintenancePolicy;
use classbell_cron::{
    AnnouncementRenderer, ChatTransport, Database, DeliveryExecutor, DeliveryPolicy,
    MessageHandle, ScheduleService, Scheduler, SendError, SendRequest,
};
use classbell_media::{GeminiAnnouncer, GeminiClient};
use classbell_storage::{
    DocumentStore, MemoryDocumentStore, RetrySchedule, SqliteDocumentStore,
    SupabaseDocumentStore,
};
use classbell_types::Target;

/// Everything a command needs, wired from the config.
pub struct App {
    pub config: ClassBellConfig,
    pub service: Arc<ScheduleService>,
    pub gemini: Option<Arc<GeminiClient>>,
}

/// Transport for one-shot commands that never deliver.
pub struct OfflineTransport;

#[async_trait]
impl ChatTransport for OfflineTransport {
    async fn send(&self, _request: &SendRequest) -> Result<MessageHandle, SendError> {
        Err(SendError::Other("no chat transport in this process".into()))
    }
}

pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn DocumentStore>> {
    let store: Arc<dyn DocumentStore> = match config.backend {
        StorageBackend::Sqlite => {
            let path = match &config.sqlite_path {
                Some(path) => path.clone(),
                None => classbell_config::ensure_config_dir()?.join("classbell.db"),
            };
            Arc::new(
                SqliteDocumentStore::open(&path, config.row_id)
                    .with_context(|| format!("Failed to open {}", path.display()))?,
            )
        }
        StorageBackend::Supabase => {
            let (Some(url), Some(key)) = (&config.supabase_url, &config.supabase_key) else {
                bail!("Supabase backend needs SUPABASE_URL and SUPABASE_KEY");
            };
            Arc::new(SupabaseDocumentStore::new(
                url,
                key,
                &config.table,
                config.row_id,
            )?)
        }
        StorageBackend::Memory => Arc::new(MemoryDocumentStore::new()),
    };
    Ok(store)
}

pub fn delivery_policy(config: &ClassBellConfig) -> Result<DeliveryPolicy> {
    let schedule = &config.schedule;
    Ok(DeliveryPolicy {
        max_retries: schedule.max_retries,
        retry_delay: Duration::from_secs(schedule.retry_delay_secs),
        retry_jitter: Duration::from_secs(schedule.retry_jitter_secs),
        render_timeout: Duration::from_secs(schedule.render_timeout_secs),
        send_timeout: Duration::from_secs(schedule.send_timeout_secs),
        tz: schedule.tz()?,
    })
}

pub fn maintenance_policy(config: &ClassBellConfig) -> MaintenancePolicy {
    MaintenancePolicy {
        stale_after: chrono::Duration::hours(config.schedule.stale_after_hours as i64),
        attendance_retention: chrono::Duration::days(
            config.schedule.attendance_retention_days as i64,
        ),
    }
}

impl App {
    /// Load the document and wire the scheduling stack around `transport`.
    pub async fn build(config: ClassBellConfig, transport: Arc<dyn ChatTransport>) -> Result<Self> {
        Self::assemble(config, transport, true).await
    }

    /// App for one-shot subcommands: changes are stored but no timer is
    /// armed, so nothing is delivered by this process.
    pub async fn offline(config: ClassBellConfig) -> Result<Self> {
        Self::assemble(config, Arc::new(OfflineTransport), false).await
    }

    async fn assemble(
        config: ClassBellConfig,
        transport: Arc<dyn ChatTransport>,
        timers: bool,
    ) -> Result<Self> {
        let policy = delivery_policy(&config)?;
        let store = open_store(&config.storage)?;
        let db = Database::open(
            store,
            RetrySchedule {
                delays: config.storage.retry_delays(),
                attempt_timeout: config.storage.write_timeout(),
            },
        )
        .await
        .context("Failed to load the bot document")?;

        let gemini = match &config.ai.gemini_api_key {
            Some(key) => Some(Arc::new(GeminiClient::new(
                key.clone(),
                config.ai.model.clone(),
                Duration::from_secs(config.ai.request_timeout_secs),
            )?)),
            None => {
                info!("No Gemini key configured, AI features disabled");
                None
            }
        };
        let renderer = gemini
            .clone()
            .map(|client| Arc::new(GeminiAnnouncer::new(client)) as Arc<dyn AnnouncementRenderer>);

        let scheduler = Arc::new(Scheduler::new(policy.tz));
        let executor = DeliveryExecutor::new(db.clone(), scheduler, transport, renderer, policy);
        let executor = Arc::new(if timers {
            executor
        } else {
            executor.without_timers()
        });
        let service = Arc::new(ScheduleService::new(db, executor));

        if let Some(chat_id) = config.group_chat_id {
            let linked = service.db().read(|doc| doc.config.target).await;
            if linked.is_none() {
                service.link_group(Target::group(chat_id), "").await?;
            }
        }

        Ok(Self {
            config,
            service,
            gemini,
        })
    }

    /// Rebuild timers from the store and start the daily jobs.
    pub async fn start(&self) -> Result<()> {
        let now = Utc::now();
        self.service.mark_started(now).await?;
        let report = self.service.recover(now).await?;
        info!(
            restored = report.restored,
            discarded = report.discarded,
            skipped = report.skipped,
            "Recovered scheduled classes"
        );

        self.service.start_daily_jobs(
            self.config.schedule.maintenance_at()?,
            self.config.schedule.daily_summary_at()?,
            maintenance_policy(&self.config),
        );
        Ok(())
    }

    /// Wait for queued document writes.
    pub async fn close(&self) -> Result<()> {
        self.service.scheduler().shutdown();
        self.service.db().flush().await?;
        Ok(())
    }
}
