//! Evaluation worker
//!
//! Converts each user's accumulated score into a cap level. One user is one
//! transaction: claim the counters, pick the highest tier whose gates pass,
//! raise the tier if it ranks higher, consume the score that was read. The
//! claim is a compare-and-set on `evaluation_version`, so two overlapping
//! cycles can never both consume the same score.

use crate::notify::{Notification, Notifier};
use crate::queue::EvaluationBatch;
use crate::registry::TierRegistry;
use async_trait::async_trait;
use cap_common::db::retry::DEFAULT_LOCK_WAIT;
use cap_common::db::{retry_on_lock, TierDefinition};
use cap_common::events::{EngineEvent, EventBus};
use cap_common::{CapLevel, Error, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Counters and flags the tier gates are checked against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub score: i64,
    pub volunteer_hours: i64,
    pub verified: bool,
}

/// True when every gate except nomination passes; `nominated` answers that one
pub fn meets_requirements(def: &TierDefinition, candidate: &Candidate, nominated: bool) -> bool {
    let score_ok = def
        .min_activity_score
        .map_or(true, |min| candidate.score >= min);
    let hours_ok = def
        .min_volunteer_hours
        .map_or(true, |min| candidate.volunteer_hours >= min);
    let verification_ok = !def.requires_verification || candidate.verified;
    let nomination_ok = !def.requires_nomination || nominated;

    score_ok && hours_ok && verification_ok && nomination_ok
}

/// Highest-ranked definition whose gates pass
///
/// `definitions` must be ordered by rank descending. Falls back to the
/// lowest level when nothing qualifies.
pub fn select_tier(definitions: &[TierDefinition], candidate: &Candidate, nominated: bool) -> CapLevel {
    definitions
        .iter()
        .find(|def| meets_requirements(def, candidate, nominated))
        .map(|def| def.tier)
        .unwrap_or(CapLevel::LOWEST)
}

/// Answers whether a user holds a nomination for a tier
#[async_trait]
pub trait NominationGate: Send + Sync {
    async fn is_nominated(&self, user_id: Uuid, tier: CapLevel) -> Result<bool>;
}

/// Gate used when no nomination mechanism is wired: nobody is nominated
pub struct NoNominations;

#[async_trait]
impl NominationGate for NoNominations {
    async fn is_nominated(&self, _user_id: Uuid, _tier: CapLevel) -> Result<bool> {
        Ok(false)
    }
}

/// Outcome for one user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UserEvaluation {
    Upgraded { from: CapLevel, to: CapLevel, consumed: i64 },
    Unchanged { tier: CapLevel, consumed: i64 },
    /// Another evaluation committed first; nothing written
    Skipped,
}

/// Per-batch tally
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub evaluated: usize,
    pub upgraded: usize,
    pub skipped: usize,
    pub failed_users: Vec<Uuid>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failed_users.is_empty()
    }
}

pub struct EvaluationWorker {
    db: SqlitePool,
    registry: TierRegistry,
    notifier: Arc<dyn Notifier>,
    nomination: Arc<dyn NominationGate>,
    event_bus: EventBus,
    notification_timeout: Duration,
    lock_wait: Duration,
}

impl EvaluationWorker {
    pub fn new(
        db: SqlitePool,
        registry: TierRegistry,
        notifier: Arc<dyn Notifier>,
        event_bus: EventBus,
        notification_timeout: Duration,
    ) -> Self {
        Self {
            db,
            registry,
            notifier,
            nomination: Arc::new(NoNominations),
            event_bus,
            notification_timeout,
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    /// How long one user's evaluation keeps retrying while the database is locked
    pub fn with_lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    pub fn with_nomination_gate(mut self, gate: Arc<dyn NominationGate>) -> Self {
        self.nomination = gate;
        self
    }

    /// Evaluate every user in the batch
    ///
    /// Tier definitions are read once per batch. Per-user failures are
    /// collected in the report; users already committed are not rolled back.
    pub async fn process_batch(&self, batch: &EvaluationBatch) -> Result<BatchReport> {
        let definitions = self.registry.list_descending().await?;
        if definitions.is_empty() {
            return Err(Error::Config(
                "Tier registry is empty; seed tier definitions before evaluating".to_string(),
            ));
        }

        let mut report = BatchReport {
            batch_id: batch.batch_id,
            ..BatchReport::default()
        };

        for &user_id in &batch.user_ids {
            match self.evaluate_user(user_id, &definitions).await {
                Ok(UserEvaluation::Upgraded { .. }) => {
                    report.evaluated += 1;
                    report.upgraded += 1;
                }
                Ok(UserEvaluation::Unchanged { .. }) => report.evaluated += 1,
                Ok(UserEvaluation::Skipped) => report.skipped += 1,
                Err(e) => {
                    warn!(batch_id = %batch.batch_id, user_id = %user_id, "Evaluation failed: {}", e);
                    report.failed_users.push(user_id);
                }
            }
        }

        info!(
            batch_id = %batch.batch_id,
            cycle_id = %batch.cycle_id,
            evaluated = report.evaluated,
            upgraded = report.upgraded,
            skipped = report.skipped,
            failed = report.failed_users.len(),
            "Batch evaluated"
        );
        self.event_bus.emit_lossy(EngineEvent::BatchEvaluated {
            batch_id: batch.batch_id,
            evaluated: report.evaluated,
            upgraded: report.upgraded,
            skipped: report.skipped,
            failed: report.failed_users.len(),
            timestamp: cap_common::time::now(),
        });

        Ok(report)
    }

    /// Evaluate one user against definitions ordered by rank descending
    ///
    /// Lock contention is retried; the notification goes out only after the
    /// upgrade is committed.
    pub async fn evaluate_user(
        &self,
        user_id: Uuid,
        definitions: &[TierDefinition],
    ) -> Result<UserEvaluation> {
        let outcome = retry_on_lock("tier evaluation", self.lock_wait, || {
            self.evaluate_user_once(user_id, definitions)
        })
        .await?;

        if let UserEvaluation::Upgraded { from, to, .. } = outcome {
            info!(user_id = %user_id, from = %from, to = %to, "Tier upgraded");
            self.send_upgrade_notification(user_id, from, to).await;
        }

        Ok(outcome)
    }

    async fn evaluate_user_once(
        &self,
        user_id: Uuid,
        definitions: &[TierDefinition],
    ) -> Result<UserEvaluation> {
        // Expected version, read outside the transaction so no snapshot is held
        let version: i64 =
            sqlx::query_scalar("SELECT evaluation_version FROM engagement_metrics WHERE user_id = ?")
                .bind(user_id.to_string())
                .fetch_optional(&self.db)
                .await?
                .ok_or_else(|| Error::NotFound(format!("Engagement metrics for user {}", user_id)))?;

        let mut tx = self.db.begin().await?;

        // The claim is the transaction's first statement: it takes the write
        // lock and performs the compare-and-set in one step.
        let claim = sqlx::query(
            r#"
            UPDATE engagement_metrics
            SET evaluation_version = evaluation_version + 1,
                last_evaluated_at = ?,
                updated_at = CURRENT_TIMESTAMP
            WHERE user_id = ? AND evaluation_version = ?
            RETURNING accumulated_score, volunteer_hours
            "#,
        )
        .bind(cap_common::time::now())
        .bind(user_id.to_string())
        .bind(version)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(claim) = claim else {
            tx.rollback().await?;
            debug!(user_id = %user_id, "Evaluation lost compare-and-set, skipping");
            return Ok(UserEvaluation::Skipped);
        };

        let user = sqlx::query("SELECT tier, verified FROM users WHERE guid = ?")
            .bind(user_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::NotFound(format!("User {}", user_id)))?;

        let current: CapLevel = user.try_get::<String, _>("tier")?.parse()?;
        let candidate = Candidate {
            score: claim.try_get("accumulated_score")?,
            volunteer_hours: claim.try_get("volunteer_hours")?,
            verified: user.try_get("verified")?,
        };

        let selected = self.choose_tier(user_id, definitions, &candidate).await?;
        let new_tier = selected.max(current);

        // Subtract what was read: increments committed later survive
        sqlx::query(
            "UPDATE engagement_metrics SET accumulated_score = accumulated_score - ? WHERE user_id = ?",
        )
        .bind(candidate.score)
        .bind(user_id.to_string())
        .execute(&mut *tx)
        .await?;

        if new_tier > current {
            sqlx::query("UPDATE users SET tier = ?, updated_at = CURRENT_TIMESTAMP WHERE guid = ?")
                .bind(new_tier.as_str())
                .bind(user_id.to_string())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        if new_tier > current {
            Ok(UserEvaluation::Upgraded {
                from: current,
                to: new_tier,
                consumed: candidate.score,
            })
        } else {
            Ok(UserEvaluation::Unchanged {
                tier: current,
                consumed: candidate.score,
            })
        }
    }

    /// Select without nomination first; ask the gate only when a nominated
    /// tier above that result is otherwise within reach
    async fn choose_tier(
        &self,
        user_id: Uuid,
        definitions: &[TierDefinition],
        candidate: &Candidate,
    ) -> Result<CapLevel> {
        let without = select_tier(definitions, candidate, false);

        let reachable = definitions.iter().find(|def| {
            def.requires_nomination && def.tier > without && meets_requirements(def, candidate, true)
        });

        match reachable {
            Some(def) if self.nomination.is_nominated(user_id, def.tier).await? => {
                Ok(select_tier(definitions, candidate, true))
            }
            _ => Ok(without),
        }
    }

    async fn send_upgrade_notification(&self, user_id: Uuid, from: CapLevel, to: CapLevel) {
        let notification = Notification::tier_upgrade(user_id, from, to);
        match tokio::time::timeout(self.notification_timeout, self.notifier.notify(&notification)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(user_id = %user_id, "Tier upgrade notification failed: {}", e),
            Err(_) => warn!(
                user_id = %user_id,
                "Tier upgrade notification timed out after {}ms",
                self.notification_timeout.as_millis()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::EventBusNotifier;
    use crate::registry::canonical_definitions;
    use crate::test_support::{insert_user, memory_db, set_metrics};

    fn descending() -> Vec<TierDefinition> {
        let mut defs = canonical_definitions();
        defs.reverse();
        defs
    }

    fn candidate(score: i64, volunteer_hours: i64, verified: bool) -> Candidate {
        Candidate { score, volunteer_hours, verified }
    }

    struct Everyone;

    #[async_trait]
    impl NominationGate for Everyone {
        async fn is_nominated(&self, _user_id: Uuid, _tier: CapLevel) -> Result<bool> {
            Ok(true)
        }
    }

    struct Broken;

    #[async_trait]
    impl Notifier for Broken {
        async fn notify(&self, _notification: &Notification) -> Result<()> {
            Err(Error::Internal("mail server down".into()))
        }
    }

    async fn worker(db: &SqlitePool) -> EvaluationWorker {
        let registry = TierRegistry::new(db.clone());
        registry.seed_defaults().await.unwrap();
        let bus = EventBus::new(16);
        EvaluationWorker::new(
            db.clone(),
            registry,
            Arc::new(EventBusNotifier::new(bus.clone())),
            bus,
            Duration::from_millis(200),
        )
    }

    #[test]
    fn test_select_tier_thresholds() {
        let defs = descending();
        assert_eq!(select_tier(&defs, &candidate(0, 0, false), false), CapLevel::None);
        assert_eq!(select_tier(&defs, &candidate(1, 0, false), false), CapLevel::Green);
        assert_eq!(select_tier(&defs, &candidate(60, 0, false), false), CapLevel::Yellow);
        assert_eq!(select_tier(&defs, &candidate(150, 0, false), false), CapLevel::Yellow);
        assert_eq!(select_tier(&defs, &candidate(150, 0, true), false), CapLevel::Red);
        assert_eq!(select_tier(&defs, &candidate(150, 400, true), false), CapLevel::Black);
        assert_eq!(
            select_tier(&defs, &candidate(150, 400, true), true),
            CapLevel::OstrichFeather
        );
    }

    #[test]
    fn test_select_tier_empty_falls_back_to_lowest() {
        assert_eq!(select_tier(&[], &candidate(500, 500, true), true), CapLevel::None);
    }

    #[tokio::test]
    async fn test_evaluation_upgrades_and_consumes() {
        let db = memory_db().await;
        let user = insert_user(&db, CapLevel::None, false).await;
        set_metrics(&db, user, 60, 0).await;
        let worker = worker(&db).await;

        let outcome = worker.evaluate_user(user, &descending()).await.unwrap();
        assert_eq!(
            outcome,
            UserEvaluation::Upgraded { from: CapLevel::None, to: CapLevel::Yellow, consumed: 60 }
        );

        let (score, evaluated_at): (i64, Option<String>) = sqlx::query_as(
            "SELECT accumulated_score, last_evaluated_at FROM engagement_metrics WHERE user_id = ?",
        )
        .bind(user.to_string())
        .fetch_one(&db)
        .await
        .unwrap();
        assert_eq!(score, 0);
        assert!(evaluated_at.is_some());
    }

    #[tokio::test]
    async fn test_tier_never_decreases() {
        let db = memory_db().await;
        let user = insert_user(&db, CapLevel::Red, true).await;
        set_metrics(&db, user, 5, 0).await;
        let worker = worker(&db).await;

        let outcome = worker.evaluate_user(user, &descending()).await.unwrap();
        assert_eq!(outcome, UserEvaluation::Unchanged { tier: CapLevel::Red, consumed: 5 });
    }

    #[tokio::test]
    async fn test_nomination_gate_unlocks_top_tier() {
        let db = memory_db().await;
        let user = insert_user(&db, CapLevel::None, true).await;
        set_metrics(&db, user, 100, 320).await;
        let worker = worker(&db).await.with_nomination_gate(Arc::new(Everyone));

        let outcome = worker.evaluate_user(user, &descending()).await.unwrap();
        assert!(matches!(outcome, UserEvaluation::Upgraded { to: CapLevel::OstrichFeather, .. }));
    }

    #[tokio::test]
    async fn test_failing_notifier_does_not_fail_evaluation() {
        let db = memory_db().await;
        let user = insert_user(&db, CapLevel::None, false).await;
        set_metrics(&db, user, 10, 0).await;
        let registry = TierRegistry::new(db.clone());
        registry.seed_defaults().await.unwrap();
        let worker = EvaluationWorker::new(
            db.clone(),
            registry,
            Arc::new(Broken),
            EventBus::new(4),
            Duration::from_millis(50),
        );

        let outcome = worker.evaluate_user(user, &descending()).await.unwrap();
        assert!(matches!(outcome, UserEvaluation::Upgraded { to: CapLevel::Green, .. }));
    }

    #[tokio::test]
    async fn test_batch_reports_missing_users() {
        let db = memory_db().await;
        let scored = insert_user(&db, CapLevel::None, false).await;
        set_metrics(&db, scored, 1, 0).await;
        let ghost = Uuid::new_v4();
        let worker = worker(&db).await;

        let batch = EvaluationBatch {
            batch_id: Uuid::new_v4(),
            cycle_id: Uuid::new_v4(),
            user_ids: vec![scored, ghost],
        };
        let report = worker.process_batch(&batch).await.unwrap();
        assert_eq!(report.evaluated, 1);
        assert_eq!(report.upgraded, 1);
        assert_eq!(report.failed_users, vec![ghost]);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_empty_registry_is_configuration_error() {
        let db = memory_db().await;
        let user = insert_user(&db, CapLevel::None, false).await;
        set_metrics(&db, user, 80, 0).await;
        let bus = EventBus::new(4);
        let worker = EvaluationWorker::new(
            db.clone(),
            TierRegistry::new(db.clone()),
            Arc::new(EventBusNotifier::new(bus.clone())),
            bus,
            Duration::from_millis(50),
        );

        let batch = EvaluationBatch {
            batch_id: Uuid::new_v4(),
            cycle_id: Uuid::new_v4(),
            user_ids: vec![user],
        };
        assert!(matches!(worker.process_batch(&batch).await, Err(Error::Config(_))));

        let score: i64 = sqlx::query_scalar("SELECT accumulated_score FROM engagement_metrics WHERE user_id = ?")
            .bind(user.to_string())
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(score, 80);
    }
}
