//! Shared fixtures for cap-engine integration tests

#![allow(dead_code)]

use cap_common::events::EventBus;
use cap_common::CapLevel;
use cap_engine::{AppState, EngineConfig};
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use tempfile::TempDir;
use uuid::Uuid;

/// File-backed database initialised exactly as the binary does it
///
/// Keep the `TempDir` alive for the duration of the test.
pub async fn setup_db() -> (TempDir, SqlitePool) {
    let dir = tempfile::tempdir().unwrap();
    let db_path = cap_common::config::prepare_root_folder(dir.path()).unwrap();
    let pool = cap_common::db::init_database(&db_path).await.unwrap();
    (dir, pool)
}

pub async fn setup_state(config: EngineConfig) -> (TempDir, AppState) {
    let (dir, db) = setup_db().await;
    let state = AppState::new(db, config, EventBus::new(64));
    state.registry.seed_defaults().await.unwrap();
    (dir, state)
}

pub async fn insert_user(db: &SqlitePool, tier: CapLevel, verified: bool) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO users (guid, tier, verified) VALUES (?, ?, ?)")
        .bind(id.to_string())
        .bind(tier.as_str())
        .bind(verified)
        .execute(db)
        .await
        .unwrap();
    id
}

/// Post created `age_secs` seconds ago
pub async fn insert_post(db: &SqlitePool, author: Uuid, age_secs: i64) -> Uuid {
    let id = Uuid::new_v4();
    let created = chrono::Utc::now() - chrono::Duration::seconds(age_secs);
    sqlx::query("INSERT INTO posts (guid, author_id, created_at) VALUES (?, ?, ?)")
        .bind(id.to_string())
        .bind(author.to_string())
        .bind(created.format("%Y-%m-%d %H:%M:%S").to_string())
        .execute(db)
        .await
        .unwrap();
    id
}

pub async fn insert_listing(db: &SqlitePool, budget: Decimal) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO monetized_listings (guid, promotion_budget) VALUES (?, ?)")
        .bind(id.to_string())
        .bind(budget.to_string())
        .execute(db)
        .await
        .unwrap();
    id
}

pub async fn user_tier(db: &SqlitePool, user: Uuid) -> CapLevel {
    let tier: String = sqlx::query_scalar("SELECT tier FROM users WHERE guid = ?")
        .bind(user.to_string())
        .fetch_one(db)
        .await
        .unwrap();
    tier.parse().unwrap()
}

pub async fn count(db: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(db)
        .await
        .unwrap()
}
