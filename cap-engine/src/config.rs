//! Engine runtime configuration
//!
//! Tunables live in the `settings` table (initialised with defaults on first
//! run). Missing or unparseable values fall back to the compiled default.

use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Runtime configuration for the scheduler, queue, workers and revenue engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Period between scheduler ticks
    pub evaluation_interval: Duration,
    /// Maximum users per evaluation batch
    pub batch_size: usize,
    /// Attempts per queued job before it is retained as failed
    pub job_attempts: u32,
    /// Base delay for exponential retry backoff
    pub job_backoff: Duration,
    /// A job running longer than this is abandoned and retried
    pub job_timeout: Duration,
    /// Number of concurrent queue workers
    pub worker_count: usize,
    /// Idle delay between queue polls
    pub worker_poll_interval: Duration,
    /// Maximum posts credited per distribution
    pub revenue_post_cap: usize,
    /// Upper bound on a single notification delivery
    pub notification_timeout: Duration,
    /// How long one evaluation or distribution retries while the database is locked
    pub lock_wait: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            evaluation_interval: Duration::from_secs(3600),
            batch_size: 500,
            job_attempts: 3,
            job_backoff: Duration::from_millis(1000),
            job_timeout: Duration::from_secs(300),
            worker_count: 4,
            worker_poll_interval: Duration::from_millis(500),
            revenue_post_cap: 5,
            notification_timeout: Duration::from_millis(2000),
            lock_wait: cap_common::db::retry::DEFAULT_LOCK_WAIT,
        }
    }
}

impl EngineConfig {
    /// Load configuration from database settings, falling back to defaults
    pub async fn from_database(db: &SqlitePool) -> Self {
        let mut config = Self::default();

        if let Some(secs) = load_setting::<u64>(db, "evaluation_interval_secs").await {
            config.evaluation_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(size) = load_setting::<usize>(db, "evaluation_batch_size").await {
            config.batch_size = size;
        }
        if let Some(attempts) = load_setting::<u32>(db, "evaluation_job_attempts").await {
            config.job_attempts = attempts;
        }
        if let Some(ms) = load_setting::<u64>(db, "evaluation_job_backoff_ms").await {
            config.job_backoff = Duration::from_millis(ms);
        }
        if let Some(secs) = load_setting::<u64>(db, "evaluation_job_timeout_secs").await {
            config.job_timeout = Duration::from_secs(secs);
        }
        if let Some(count) = load_setting::<usize>(db, "worker_count").await {
            config.worker_count = count;
        }
        if let Some(ms) = load_setting::<u64>(db, "worker_poll_interval_ms").await {
            config.worker_poll_interval = Duration::from_millis(ms);
        }
        if let Some(cap) = load_setting::<usize>(db, "revenue_post_cap").await {
            config.revenue_post_cap = cap;
        }
        if let Some(ms) = load_setting::<u64>(db, "notification_timeout_ms").await {
            config.notification_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = load_setting::<u64>(db, "database_lock_wait_ms").await {
            config.lock_wait = Duration::from_millis(ms);
        }

        config.sanitized()
    }

    /// Clamp values that would stall the engine
    pub fn sanitized(mut self) -> Self {
        if self.batch_size == 0 {
            warn!("evaluation_batch_size must be positive, using 500");
            self.batch_size = 500;
        }
        if self.job_attempts == 0 {
            warn!("evaluation_job_attempts must be positive, using 1");
            self.job_attempts = 1;
        }
        if self.worker_count == 0 {
            warn!("worker_count must be positive, using 1");
            self.worker_count = 1;
        }
        self
    }
}

async fn load_setting<T: FromStr>(db: &SqlitePool, key: &str) -> Option<T> {
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(db)
        .await
        .ok()
        .flatten();

    let value = value?;
    match value.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Setting '{}' has unparseable value '{}', using default", key, value);
            None
        }
    }
}
