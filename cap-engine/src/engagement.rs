//! Engagement score store
//!
//! Collaborators never write counters directly: they submit `EngagementDelta`
//! events which are applied with an atomic SQL increment. The only decrement
//! is the evaluation worker consuming the score it read.

use cap_common::db::{EngagementMetrics, UserRecord};
use cap_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// A change to a user's engagement counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "amount", rename_all = "snake_case")]
pub enum EngagementDelta {
    /// Points earned from likes, comments, shares and posts
    Score(u32),
    /// Volunteer hours logged
    VolunteerHours(u32),
}

/// Access to per-user engagement counters
#[derive(Clone)]
pub struct EngagementStore {
    db: SqlitePool,
}

impl EngagementStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Apply a delta, creating the metrics row on first use
    ///
    /// Fails with NotFound when the user does not exist.
    pub async fn apply(&self, user_id: Uuid, delta: EngagementDelta) -> Result<()> {
        let (score, hours) = match delta {
            EngagementDelta::Score(points) => (i64::from(points), 0),
            EngagementDelta::VolunteerHours(h) => (0, i64::from(h)),
        };
        if score == 0 && hours == 0 {
            return Ok(());
        }

        let user_exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE guid = ?)")
                .bind(user_id.to_string())
                .fetch_one(&self.db)
                .await?;
        if !user_exists {
            return Err(Error::NotFound(format!("User {}", user_id)));
        }

        sqlx::query(
            r#"
            INSERT INTO engagement_metrics (user_id, accumulated_score, volunteer_hours)
            VALUES (?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                accumulated_score = accumulated_score + excluded.accumulated_score,
                volunteer_hours = volunteer_hours + excluded.volunteer_hours,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(user_id.to_string())
        .bind(score)
        .bind(hours)
        .execute(&self.db)
        .await?;

        tracing::trace!(user_id = %user_id, ?delta, "Applied engagement delta");
        Ok(())
    }

    /// Current accumulated score (0 when the user has no metrics yet)
    pub async fn current_score(&self, user_id: Uuid) -> Result<i64> {
        self.ensure_user(user_id).await?;
        let score: Option<i64> = sqlx::query_scalar(
            "SELECT accumulated_score FROM engagement_metrics WHERE user_id = ?",
        )
        .bind(user_id.to_string())
        .fetch_optional(&self.db)
        .await?;
        Ok(score.unwrap_or(0))
    }

    /// Full metrics row
    pub async fn metrics(&self, user_id: Uuid) -> Result<EngagementMetrics> {
        let row = sqlx::query(
            r#"
            SELECT accumulated_score, volunteer_hours, last_evaluated_at, evaluation_version
            FROM engagement_metrics WHERE user_id = ?
            "#,
        )
        .bind(user_id.to_string())
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Engagement metrics for user {}", user_id)))?;

        Ok(EngagementMetrics {
            user_id,
            accumulated_score: row.try_get("accumulated_score")?,
            volunteer_hours: row.try_get("volunteer_hours")?,
            last_evaluated_at: row.try_get("last_evaluated_at")?,
            evaluation_version: row.try_get("evaluation_version")?,
        })
    }

    /// User tier and verification flag
    pub async fn user(&self, user_id: Uuid) -> Result<UserRecord> {
        let row = sqlx::query("SELECT tier, verified FROM users WHERE guid = ?")
            .bind(user_id.to_string())
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| Error::NotFound(format!("User {}", user_id)))?;

        let tier: String = row.try_get("tier")?;
        Ok(UserRecord {
            guid: user_id,
            tier: tier.parse()?,
            verified: row.try_get("verified")?,
        })
    }

    /// Every user with a metrics row, in one consistent read
    pub async fn snapshot_scored_users(&self) -> Result<Vec<Uuid>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT user_id FROM engagement_metrics ORDER BY user_id")
                .fetch_all(&self.db)
                .await?;

        ids.iter()
            .map(|id| Uuid::parse_str(id).map_err(Error::from))
            .collect()
    }

    async fn ensure_user(&self, user_id: Uuid) -> Result<()> {
        self.user(user_id).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{insert_user, memory_db};
    use cap_common::CapLevel;

    #[tokio::test]
    async fn test_deltas_accumulate() {
        let db = memory_db().await;
        let user = insert_user(&db, CapLevel::None, false).await;
        let store = EngagementStore::new(db);

        store.apply(user, EngagementDelta::Score(10)).await.unwrap();
        store.apply(user, EngagementDelta::Score(5)).await.unwrap();
        store.apply(user, EngagementDelta::VolunteerHours(3)).await.unwrap();

        let metrics = store.metrics(user).await.unwrap();
        assert_eq!(metrics.accumulated_score, 15);
        assert_eq!(metrics.volunteer_hours, 3);
        assert!(metrics.last_evaluated_at.is_none());
        assert_eq!(store.current_score(user).await.unwrap(), 15);
    }

    #[tokio::test]
    async fn test_zero_delta_creates_nothing() {
        let db = memory_db().await;
        let user = insert_user(&db, CapLevel::None, false).await;
        let store = EngagementStore::new(db);

        store.apply(user, EngagementDelta::Score(0)).await.unwrap();
        assert!(store.snapshot_scored_users().await.unwrap().is_empty());
        assert_eq!(store.current_score(user).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_user_is_not_found() {
        let store = EngagementStore::new(memory_db().await);
        let err = store.apply(Uuid::new_v4(), EngagementDelta::Score(1)).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(matches!(store.current_score(Uuid::new_v4()).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_snapshot_lists_scored_users_only() {
        let db = memory_db().await;
        let scored = insert_user(&db, CapLevel::None, false).await;
        let _idle = insert_user(&db, CapLevel::None, false).await;
        let store = EngagementStore::new(db);
        store.apply(scored, EngagementDelta::Score(1)).await.unwrap();

        assert_eq!(store.snapshot_scored_users().await.unwrap(), vec![scored]);
    }

    #[test]
    fn test_delta_wire_format() {
        let json = serde_json::to_value(EngagementDelta::VolunteerHours(4)).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "volunteer_hours", "amount": 4}));
    }
}
