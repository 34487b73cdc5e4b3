//! Database initialization
//!
//! Creates the database file on first run, applies connection pragmas,
//! creates every table idempotently, runs versioned migrations and seeds
//! default settings.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Per-connection wait for the SQLite write lock
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default settings written on first run: (key, value)
pub const DEFAULT_SETTINGS: &[(&str, &str)] = &[
    ("evaluation_interval_secs", "3600"),
    ("evaluation_batch_size", "500"),
    ("evaluation_job_attempts", "3"),
    ("evaluation_job_backoff_ms", "1000"),
    ("evaluation_job_timeout_secs", "300"),
    ("worker_count", "4"),
    ("worker_poll_interval_ms", "500"),
    ("revenue_post_cap", "5"),
    ("notification_timeout_ms", "2000"),
    ("database_lock_wait_ms", "10000"),
];

/// Initialize database connection and create tables if needed
///
/// WAL, busy timeout and foreign keys are connection options, so every
/// pooled connection carries them.
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(16)
        .min_connections(2)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&pool).await?;
    crate::db::migrations::run_migrations(&pool).await?;
    init_default_settings(&pool).await?;

    Ok(pool)
}

/// Create every engine table (idempotent)
///
/// Usable on its own against an in-memory pool in tests.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA foreign_keys = ON").execute(pool).await?;

    create_schema_version_table(pool).await?;
    create_settings_table(pool).await?;
    create_users_table(pool).await?;
    create_engagement_metrics_table(pool).await?;
    create_tier_definitions_table(pool).await?;
    create_posts_table(pool).await?;
    create_monetized_listings_table(pool).await?;
    create_post_ad_attachments_table(pool).await?;
    create_revenue_ledger_table(pool).await?;
    create_job_queue_table(pool).await?;

    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Users are owned by the identity subsystem; the engine only writes `tier`.
async fn create_users_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            guid TEXT PRIMARY KEY,
            tier TEXT NOT NULL DEFAULT 'NONE',
            verified INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_engagement_metrics_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS engagement_metrics (
            user_id TEXT PRIMARY KEY REFERENCES users(guid) ON DELETE CASCADE,
            accumulated_score INTEGER NOT NULL DEFAULT 0 CHECK (accumulated_score >= 0),
            volunteer_hours INTEGER NOT NULL DEFAULT 0 CHECK (volunteer_hours >= 0),
            last_evaluated_at TIMESTAMP,
            evaluation_version INTEGER NOT NULL DEFAULT 0,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_tier_definitions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tier_definitions (
            tier TEXT PRIMARY KEY,
            rank INTEGER NOT NULL UNIQUE,
            min_activity_score INTEGER,
            min_volunteer_hours INTEGER,
            requires_verification INTEGER NOT NULL DEFAULT 0,
            requires_nomination INTEGER NOT NULL DEFAULT 0,
            ad_share_percentage TEXT NOT NULL DEFAULT '0',
            can_access_marketplace INTEGER NOT NULL DEFAULT 0,
            can_access_volunteer_hub INTEGER NOT NULL DEFAULT 0,
            can_receive_brand_deals INTEGER NOT NULL DEFAULT 0,
            description TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Posts are owned by the content subsystem; the engine only reads them.
async fn create_posts_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS posts (
            guid TEXT PRIMARY KEY,
            author_id TEXT NOT NULL REFERENCES users(guid) ON DELETE CASCADE,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_posts_created_at ON posts(created_at)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_monetized_listings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS monetized_listings (
            guid TEXT PRIMARY KEY,
            promotion_budget TEXT NOT NULL,
            spent TEXT NOT NULL DEFAULT '0',
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_post_ad_attachments_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS post_ad_attachments (
            guid TEXT PRIMARY KEY,
            post_id TEXT NOT NULL REFERENCES posts(guid) ON DELETE CASCADE,
            listing_id TEXT NOT NULL REFERENCES monetized_listings(guid) ON DELETE CASCADE,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Append-only: rows are never updated or deleted by the engine.
async fn create_revenue_ledger_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS revenue_ledger (
            guid TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(guid),
            post_id TEXT NOT NULL REFERENCES posts(guid),
            listing_id TEXT NOT NULL REFERENCES monetized_listings(guid),
            amount TEXT NOT NULL,
            entry_type TEXT NOT NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_revenue_ledger_listing ON revenue_ledger(listing_id)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Durable work queue. Times are unix milliseconds so they compare numerically.
async fn create_job_queue_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_queue (
            guid TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'waiting',
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            backoff_ms INTEGER NOT NULL DEFAULT 1000,
            remove_on_complete INTEGER NOT NULL DEFAULT 1,
            remove_on_fail INTEGER NOT NULL DEFAULT 0,
            run_after_ms INTEGER NOT NULL,
            locked_until_ms INTEGER,
            last_error TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Initialize or repair default settings
///
/// Missing keys are inserted; NULL values are reset to their default.
pub async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    for (key, value) in DEFAULT_SETTINGS {
        ensure_setting(pool, key, value).await?;
    }
    Ok(())
}

async fn ensure_setting(pool: &SqlitePool, key: &str, default_value: &str) -> Result<()> {
    let existing: Option<Option<String>> =
        sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;

    match existing {
        None => {
            // INSERT OR IGNORE handles two processes initializing at once
            sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
                .bind(key)
                .bind(default_value)
                .execute(pool)
                .await?;
            info!("Initialized setting '{}' with default value: {}", key, default_value);
        }
        Some(None) => {
            sqlx::query(
                "UPDATE settings SET value = ?, updated_at = CURRENT_TIMESTAMP WHERE key = ?",
            )
            .bind(default_value)
            .bind(key)
            .execute(pool)
            .await?;
            warn!("Setting '{}' was NULL, reset to default: {}", key, default_value);
        }
        Some(Some(_)) => {}
    }

    Ok(())
}
