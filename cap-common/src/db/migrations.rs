//! Database schema migrations
//!
//! Versioned migrations tracked in the `schema_version` table. Each migration
//! is idempotent and runs after `CREATE TABLE IF NOT EXISTS`.
//!
//! # Migration Guidelines
//!
//! 1. Never modify existing migrations
//! 2. Add a new `migrate_vN` function per schema change and bump
//!    `CURRENT_SCHEMA_VERSION`
//! 3. Prefer ALTER TABLE / CREATE INDEX over DROP/CREATE to preserve data

use crate::Result;
use sqlx::SqlitePool;
use tracing::{info, warn};

/// Current schema version
///
/// **IMPORTANT:** Increment this when adding new migrations
pub const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Get current schema version from database (0 when never migrated)
pub async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    let table_exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM sqlite_master
            WHERE type='table' AND name='schema_version'
        )
        "#,
    )
    .fetch_one(pool)
    .await?;

    if !table_exists {
        return Ok(0);
    }

    let version: Option<i32> =
        sqlx::query_scalar("SELECT version FROM schema_version ORDER BY version DESC LIMIT 1")
            .fetch_optional(pool)
            .await?;

    Ok(version.unwrap_or(0))
}

async fn set_schema_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;

    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let current_version = get_schema_version(pool).await?;

    if current_version == CURRENT_SCHEMA_VERSION {
        info!("Database schema is up to date (v{})", current_version);
        return Ok(());
    }

    if current_version > CURRENT_SCHEMA_VERSION {
        warn!(
            "Database schema version ({}) is newer than code version ({})",
            current_version, CURRENT_SCHEMA_VERSION
        );
        warn!("This may indicate a downgrade. Proceeding with caution.");
        return Ok(());
    }

    info!(
        "Running database migrations: v{} -> v{}",
        current_version, CURRENT_SCHEMA_VERSION
    );

    if current_version < 1 {
        migrate_v1(pool).await?;
        set_schema_version(pool, 1).await?;
        info!("✓ Migration v1 completed");
    }

    if current_version < 2 {
        migrate_v2(pool).await?;
        set_schema_version(pool, 2).await?;
        info!("✓ Migration v2 completed");
    }

    info!("All migrations completed successfully");
    Ok(())
}

/// Migration v1: at most one active ad attachment per post
///
/// Partial unique index; the revenue engine relies on it to reject a second
/// concurrent attachment of the same post.
async fn migrate_v1(pool: &SqlitePool) -> Result<()> {
    info!("Running migration v1: unique active attachment per post");

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_post_ad_attachments_active_post
        ON post_ad_attachments(post_id) WHERE active = 1
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Migration v2: index used by the queue's claim query
async fn migrate_v2(pool: &SqlitePool) -> Result<()> {
    info!("Running migration v2: job queue claim index");

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_job_queue_claim ON job_queue(status, run_after_ms)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
