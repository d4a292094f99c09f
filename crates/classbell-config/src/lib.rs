use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON5 parse error: {0}")]
    Json5(#[from] json5::Error),
    #[error("Config directory not found")]
    NoDirFound,
    #[error("Unknown timezone: {0}")]
    Timezone(String),
    #[error("Invalid time of day {0:?} (expected HH:MM)")]
    TimeOfDay(String),
}

/// Telegram bot settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,
    /// Usernames (without `@`) allowed to manage schedules. Empty means everyone.
    #[serde(default)]
    pub admins: Vec<String>,
}

/// Which durable store holds the bot document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Sqlite,
    Supabase,
    Memory,
}

/// Durable store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    /// SQLite file; defaults to `~/.classbell/classbell.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqlite_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supabase_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supabase_key: Option<String>,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_row_id")]
    pub row_id: i64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    /// Waits between write attempts; one attempt more than entries.
    #[serde(default = "default_retry_delays")]
    pub retry_delays_secs: Vec<u64>,
}

fn default_backend() -> StorageBackend {
    StorageBackend::Sqlite
}

fn default_table() -> String {
    "bot_storage".to_string()
}

fn default_row_id() -> i64 {
    1
}

fn default_write_timeout() -> u64 {
    20
}

fn default_retry_delays() -> Vec<u64> {
    vec![1, 3, 10]
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            sqlite_path: None,
            supabase_url: None,
            supabase_key: None,
            table: default_table(),
            row_id: default_row_id(),
            write_timeout_secs: default_write_timeout(),
            retry_delays_secs: default_retry_delays(),
        }
    }
}

impl StorageConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry_delays_secs
            .iter()
            .copied()
            .map(Duration::from_secs)
            .collect()
    }
}

/// Gemini settings. AI features are off when no key is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gemini_api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_ai_timeout")]
    pub request_timeout_secs: u64,
}

fn default_model() -> String {
    "gemini-1.5-flash".to_string()
}

fn default_ai_timeout() -> u64 {
    30
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            gemini_api_key: None,
            model: default_model(),
            request_timeout_secs: default_ai_timeout(),
        }
    }
}

/// Scheduling and delivery tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// IANA zone used for all wall-clock input.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter_secs: u64,
    #[serde(default = "default_step_timeout")]
    pub render_timeout_secs: u64,
    #[serde(default = "default_step_timeout")]
    pub send_timeout_secs: u64,
    /// "HH:MM" for the next-day summary; disabled when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_summary_time: Option<String>,
    #[serde(default = "default_maintenance_time")]
    pub maintenance_time: String,
    #[serde(default = "default_stale_after")]
    pub stale_after_hours: u64,
    #[serde(default = "default_attendance_retention")]
    pub attendance_retention_days: u64,
}

fn default_timezone() -> String {
    "Asia/Kolkata".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    60
}

fn default_retry_jitter() -> u64 {
    30
}

fn default_step_timeout() -> u64 {
    30
}

fn default_maintenance_time() -> String {
    "03:00".to_string()
}

fn default_stale_after() -> u64 {
    24
}

fn default_attendance_retention() -> u64 {
    30
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
            retry_jitter_secs: default_retry_jitter(),
            render_timeout_secs: default_step_timeout(),
            send_timeout_secs: default_step_timeout(),
            daily_summary_time: None,
            maintenance_time: default_maintenance_time(),
            stale_after_hours: default_stale_after(),
            attendance_retention_days: default_attendance_retention(),
        }
    }
}

impl ScheduleConfig {
    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::Timezone(self.timezone.clone()))
    }

    pub fn daily_summary_at(&self) -> Result<Option<NaiveTime>, ConfigError> {
        self.daily_summary_time
            .as_deref()
            .map(parse_time_of_day)
            .transpose()
    }

    pub fn maintenance_at(&self) -> Result<NaiveTime, ConfigError> {
        parse_time_of_day(&self.maintenance_time)
    }
}

/// Parse "HH:MM" (also accepts "H:MM").
pub fn parse_time_of_day(raw: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|_| ConfigError::TimeOfDay(raw.to_string()))
}

/// Top-level classbell configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassBellConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    /// Group to announce in before one is linked from chat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_chat_id: Option<i64>,
}

impl ClassBellConfig {
    /// Overlay deployment environment variables on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        if let Some(token) = get("BOT_TOKEN") {
            self.telegram.bot_token = Some(token);
        }
        if let Some(admins) = get("ADMIN_USERNAMES") {
            self.telegram.admins = admins
                .split(',')
                .map(|a| a.trim().trim_start_matches('@').to_string())
                .filter(|a| !a.is_empty())
                .collect();
        }
        if let Some(key) = get("GEMINI_API_KEY") {
            self.ai.gemini_api_key = Some(key);
        }
        if let Some(group) = get("GROUP_CHAT_ID") {
            match group.trim().parse::<i64>() {
                Ok(id) => self.group_chat_id = Some(id),
                Err(_) => tracing::warn!("Ignoring GROUP_CHAT_ID={group:?}: not an integer"),
            }
        }
        if let Some(url) = get("SUPABASE_URL") {
            self.storage.supabase_url = Some(url);
            self.storage.backend = StorageBackend::Supabase;
        }
        if let Some(key) = get("SUPABASE_KEY") {
            self.storage.supabase_key = Some(key);
        }
    }
}

/// Resolve the classbell config directory (~/.classbell/).
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|h| h.join(".classbell"))
        .ok_or(ConfigError::NoDirFound)
}

/// Resolve the config file path (~/.classbell/config.json5).
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json5"))
}

/// Load configuration from the default path, falling back to defaults,
/// then apply environment overrides.
pub fn load_config() -> Result<ClassBellConfig, ConfigError> {
    load_config_at(&config_file_path()?)
}

/// Same as [`load_config`] with an explicit file.
pub fn load_config_at(path: &Path) -> Result<ClassBellConfig, ConfigError> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let mut config = load_config_from(path)?;
    config.apply_env_overrides();
    Ok(config)
}

/// Load configuration from a specific path, falling back to defaults if not found.
pub fn load_config_from(path: &Path) -> Result<ClassBellConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("Config file not found at {}, using defaults", path.display());
        return Ok(ClassBellConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: ClassBellConfig = json5::from_str(&content)?;
    Ok(config)
}

/// Ensure the config directory exists.
pub fn ensure_config_dir() -> Result<PathBuf, ConfigError> {
    let dir = config_dir()?;
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = ClassBellConfig::default();
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert_eq!(config.storage.table, "bot_storage");
        assert_eq!(config.storage.row_id, 1);
        assert_eq!(config.schedule.max_retries, 3);
        assert_eq!(config.ai.model, "gemini-1.5-flash");
        assert_eq!(config.schedule.tz().unwrap(), chrono_tz::Asia::Kolkata);
    }

    #[test]
    fn test_json5_parse() {
        let json5_str = r#"{
            telegram: { admins: ["alice"] },
            storage: { backend: "memory" },
            schedule: {
                timezone: "Europe/Berlin",
                max_retries: 5,
                daily_summary_time: "20:30",
            },
        }"#;
        let config: ClassBellConfig = json5::from_str(json5_str).unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.telegram.admins, vec!["alice".to_string()]);
        assert_eq!(config.schedule.max_retries, 5);
        assert_eq!(config.schedule.retry_delay_secs, 60);
        assert_eq!(
            config.schedule.daily_summary_at().unwrap(),
            NaiveTime::from_hms_opt(20, 30, 0)
        );
    }

    #[test]
    fn test_unknown_timezone() {
        let schedule = ScheduleConfig {
            timezone: "Mars/Olympus".into(),
            ..ScheduleConfig::default()
        };
        assert!(matches!(schedule.tz(), Err(ConfigError::Timezone(_))));
    }

    #[test]
    fn test_parse_time_of_day() {
        assert_eq!(
            parse_time_of_day("9:05").unwrap(),
            NaiveTime::from_hms_opt(9, 5, 0).unwrap()
        );
        assert!(parse_time_of_day("25:00").is_err());
        assert!(parse_time_of_day("noon").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("BOT_TOKEN", "123:ABC"),
            ("ADMIN_USERNAMES", "@alice, bob,,"),
            ("GROUP_CHAT_ID", "-100555"),
            ("SUPABASE_URL", "https://db.example.co"),
            ("SUPABASE_KEY", "secret"),
            ("GEMINI_API_KEY", ""),
        ]);
        let mut config = ClassBellConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.telegram.bot_token.as_deref(), Some("123:ABC"));
        assert_eq!(config.telegram.admins, vec!["alice", "bob"]);
        assert_eq!(config.group_chat_id, Some(-100555));
        assert_eq!(config.storage.backend, StorageBackend::Supabase);
        assert_eq!(config.storage.supabase_key.as_deref(), Some("secret"));
        assert!(config.ai.gemini_api_key.is_none());
    }

    #[test]
    fn test_invalid_group_id_ignored() {
        let mut config = ClassBellConfig::default();
        config.apply_overrides(|k| (k == "GROUP_CHAT_ID").then(|| "abc".to_string()));
        assert!(config.group_chat_id.is_none());
    }
}
