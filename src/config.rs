//! Configuration types.
//!
//! Everything is read from the environment with typed defaults. A variable
//! that is set but does not parse is an error rather than a silent default.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::mailboxes::SubscriptionConfig;

/// Tunables for ingestion, actions and SLA escalation.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Max messages fetched per pull sync.
    pub batch_size: usize,
    /// How far back the first sync of a mailbox looks.
    pub initial_lookback: chrono::Duration,
    /// Upper bound on any single gateway call.
    pub gateway_timeout: Duration,
    /// How long a pull sync holds the mailbox lease.
    pub lease_duration: chrono::Duration,
    /// Mailboxes synced concurrently in one run.
    pub max_parallel_syncs: usize,
    /// Due offset for escalation tasks.
    pub escalation_due: chrono::Duration,
    /// Due offset for rule-created tasks without a follow-up delay.
    pub default_task_due: chrono::Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            initial_lookback: chrono::Duration::minutes(60),
            gateway_timeout: Duration::from_secs(30),
            lease_duration: chrono::Duration::minutes(10),
            max_parallel_syncs: 4,
            escalation_due: chrono::Duration::hours(2),
            default_task_due: chrono::Duration::hours(24),
        }
    }
}

/// Timer and job-runner settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub sync_interval: Duration,
    pub sla_scan_interval: Duration,
    /// Cron expression that replaces `sla_scan_interval` when set.
    pub sla_scan_cron: Option<String>,
    pub renewal_sweep_interval: Duration,
    pub job_poll_interval: Duration,
    /// Backoff sequence; attempts = delays + 1.
    pub retry_delays: Vec<Duration>,
    /// Max due jobs claimed per poll.
    pub job_batch: usize,
    /// Running jobs older than this are considered abandoned.
    pub stale_job_after: chrono::Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(300),
            sla_scan_interval: Duration::from_secs(3600),
            sla_scan_cron: None,
            renewal_sweep_interval: Duration::from_secs(3600),
            job_poll_interval: Duration::from_secs(15),
            retry_delays: vec![
                Duration::from_secs(30),
                Duration::from_secs(120),
                Duration::from_secs(300),
            ],
            job_batch: 32,
            stale_job_after: chrono::Duration::minutes(30),
        }
    }
}

/// Process-wide configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub http_port: u16,
    pub log_dir: Option<PathBuf>,
    pub seed_file: Option<PathBuf>,
    pub alert_webhook_url: Option<String>,
    pub pipeline: PipelineConfig,
    pub scheduler: SchedulerConfig,
    pub subscriptions: SubscriptionConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let pipeline_defaults = PipelineConfig::default();
        let scheduler_defaults = SchedulerConfig::default();
        let subscription_defaults = SubscriptionConfig::default();

        let pipeline = PipelineConfig {
            batch_size: env_parse("INBOX_OPS_BATCH_SIZE", pipeline_defaults.batch_size)?,
            initial_lookback: chrono::Duration::minutes(env_parse(
                "INBOX_OPS_INITIAL_LOOKBACK_MINS",
                60,
            )?),
            gateway_timeout: Duration::from_secs(env_parse("INBOX_OPS_GATEWAY_TIMEOUT_SECS", 30)?),
            lease_duration: chrono::Duration::seconds(env_parse("INBOX_OPS_LEASE_SECS", 600)?),
            max_parallel_syncs: env_parse(
                "INBOX_OPS_MAX_PARALLEL_SYNCS",
                pipeline_defaults.max_parallel_syncs,
            )?
            .max(1),
            ..pipeline_defaults
        };

        let retry_delays = match std::env::var("INBOX_OPS_RETRY_DELAYS_SECS") {
            Ok(raw) => parse_delays(&raw)?,
            Err(_) => scheduler_defaults.retry_delays.clone(),
        };

        let scheduler = SchedulerConfig {
            sync_interval: Duration::from_secs(env_parse("INBOX_OPS_SYNC_INTERVAL_SECS", 300)?),
            sla_scan_interval: Duration::from_secs(env_parse(
                "INBOX_OPS_SLA_SCAN_INTERVAL_SECS",
                3600,
            )?),
            sla_scan_cron: env_opt("INBOX_OPS_SLA_SCAN_CRON"),
            renewal_sweep_interval: Duration::from_secs(env_parse(
                "INBOX_OPS_RENEWAL_SWEEP_SECS",
                3600,
            )?),
            job_poll_interval: Duration::from_secs(env_parse("INBOX_OPS_JOB_POLL_SECS", 15)?),
            retry_delays,
            ..scheduler_defaults
        };

        let subscriptions = SubscriptionConfig {
            notification_url: env_opt("INBOX_OPS_WEBHOOK_URL"),
            ..subscription_defaults
        };

        Ok(Self {
            db_path: PathBuf::from(
                std::env::var("INBOX_OPS_DB_PATH")
                    .unwrap_or_else(|_| "./data/inbox-ops.db".to_string()),
            ),
            http_port: env_parse("INBOX_OPS_HTTP_PORT", 8080)?,
            log_dir: env_opt("INBOX_OPS_LOG_DIR").map(PathBuf::from),
            seed_file: env_opt("INBOX_OPS_SEED_FILE").map(PathBuf::from),
            alert_webhook_url: env_opt("INBOX_OPS_ALERT_WEBHOOK_URL"),
            pipeline,
            scheduler,
            subscriptions,
        })
    }
}

/// Non-empty env var, trimmed.
fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_opt(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{raw}': {e}"),
    })
}

/// Parse a comma-separated list of seconds, e.g. `30,120,300`.
fn parse_delays(raw: &str) -> Result<Vec<Duration>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_value::<u64>("INBOX_OPS_RETRY_DELAYS_SECS", s).map(Duration::from_secs))
        .collect()
}
