//! Durable work queue
//!
//! SQLite-backed job queue shared by the scheduler (producer) and the worker
//! pool (consumers). Jobs survive restarts; a claimed job carries a lease
//! (`locked_until_ms`) so work abandoned by a crashed worker is recovered.
//!
//! Status lifecycle: `waiting` → `active` → removed (success) or back to
//! `waiting` with exponential backoff (failure with attempts left) or
//! `failed` (attempts exhausted, retained for manual replay).

use crate::config::EngineConfig;
use cap_common::time::backoff_delay;
use cap_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One partition of a scheduler snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationBatch {
    pub batch_id: Uuid,
    /// Scheduler tick that produced this batch
    pub cycle_id: Uuid,
    pub user_ids: Vec<Uuid>,
}

/// Every kind of queued work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    /// Re-evaluate the cap level of every user in the batch
    EvaluateBatch(EvaluationBatch),
    /// Distribute a listing's promotion budget
    DistributeRevenue { listing_id: Uuid },
}

impl Job {
    pub fn kind(&self) -> &'static str {
        match self {
            Job::EvaluateBatch(_) => "evaluate_batch",
            Job::DistributeRevenue { .. } => "distribute_revenue",
        }
    }
}

/// Per-job retention and retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(1000),
            remove_on_complete: true,
            remove_on_fail: false,
        }
    }
}

impl JobOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.job_attempts,
            backoff: config.job_backoff,
            ..Self::default()
        }
    }
}

/// A job leased to one worker
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: Uuid,
    pub job: Job,
    /// Attempt number of this lease (1-based)
    pub attempts: u32,
    pub max_attempts: u32,
    backoff_ms: i64,
    remove_on_complete: bool,
    remove_on_fail: bool,
}

/// What happened to a job after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Back in the queue, runnable after the backoff delay
    Retrying { delay: Duration },
    /// Attempts exhausted; kept with status `failed`
    Failed,
    /// Attempts exhausted and `remove_on_fail` set
    Discarded,
    /// Lease was lost (recovered as stalled) before the result was recorded
    LeaseLost,
}

/// Queue depth by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: i64,
    pub active: i64,
    pub failed: i64,
}

/// A job retained after exhausting its attempts
#[derive(Debug, Clone, Serialize)]
pub struct FailedJob {
    pub id: Uuid,
    pub kind: String,
    pub attempts: i64,
    pub last_error: Option<String>,
}

/// Durable job queue backed by the `job_queue` table
#[derive(Clone)]
pub struct JobQueue {
    db: SqlitePool,
}

impl JobQueue {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Enqueue a single job
    pub async fn enqueue(&self, job: &Job, options: JobOptions) -> Result<Uuid> {
        let ids = self.enqueue_all(std::slice::from_ref(job), options).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| Error::Queue("enqueue returned no job id".to_string()))
    }

    /// Enqueue jobs in one transaction: either all are queued or none are
    pub async fn enqueue_all(&self, jobs: &[Job], options: JobOptions) -> Result<Vec<Uuid>> {
        let now = now_ms();
        let mut tx = self.db.begin().await?;
        let mut ids = Vec::with_capacity(jobs.len());

        for job in jobs {
            let id = Uuid::new_v4();
            let payload = serde_json::to_string(job)?;
            sqlx::query(
                r#"
                INSERT INTO job_queue (
                    guid, kind, payload, status, attempts, max_attempts, backoff_ms,
                    remove_on_complete, remove_on_fail, run_after_ms
                ) VALUES (?, ?, ?, 'waiting', 0, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(id.to_string())
            .bind(job.kind())
            .bind(payload)
            .bind(i64::from(options.max_attempts))
            .bind(duration_ms(options.backoff))
            .bind(options.remove_on_complete)
            .bind(options.remove_on_fail)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            ids.push(id);
        }

        tx.commit().await?;
        debug!(count = ids.len(), "Enqueued jobs");
        Ok(ids)
    }

    /// Lease the oldest runnable job, if any
    ///
    /// A single UPDATE ... RETURNING, so two workers can never claim the same job.
    pub async fn claim(&self, lease: Duration) -> Result<Option<QueuedJob>> {
        let now = now_ms();
        let row = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'active',
                attempts = attempts + 1,
                locked_until_ms = ?,
                updated_at = CURRENT_TIMESTAMP
            WHERE guid = (
                SELECT guid FROM job_queue
                WHERE status = 'waiting' AND run_after_ms <= ?
                ORDER BY run_after_ms, created_at
                LIMIT 1
            )
            RETURNING guid, payload, attempts, max_attempts, backoff_ms,
                      remove_on_complete, remove_on_fail
            "#,
        )
        .bind(now.saturating_add(duration_ms(lease)))
        .bind(now)
        .fetch_optional(&self.db)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id_str: String = row.try_get("guid")?;
        let id = Uuid::parse_str(&id_str)?;
        let payload: String = row.try_get("payload")?;

        let job: Job = match serde_json::from_str(&payload) {
            Ok(job) => job,
            Err(e) => {
                // Retrying cannot fix a payload this build cannot decode
                error!(job_id = %id, "Undecodable job payload, marking failed: {}", e);
                sqlx::query(
                    "UPDATE job_queue SET status = 'failed', locked_until_ms = NULL, last_error = ? WHERE guid = ?",
                )
                .bind(format!("undecodable payload: {}", e))
                .bind(&id_str)
                .execute(&self.db)
                .await?;
                return Err(Error::Queue(format!("Job {} has an undecodable payload", id)));
            }
        };

        let attempts: i64 = row.try_get("attempts")?;
        let max_attempts: i64 = row.try_get("max_attempts")?;

        Ok(Some(QueuedJob {
            id,
            job,
            attempts: attempts.max(0) as u32,
            max_attempts: max_attempts.max(0) as u32,
            backoff_ms: row.try_get("backoff_ms")?,
            remove_on_complete: row.try_get("remove_on_complete")?,
            remove_on_fail: row.try_get("remove_on_fail")?,
        }))
    }

    /// Record success: remove the job (or mark it completed when retained)
    pub async fn complete(&self, leased: &QueuedJob) -> Result<()> {
        let sql = if leased.remove_on_complete {
            "DELETE FROM job_queue WHERE guid = ? AND status = 'active' AND attempts = ?"
        } else {
            "UPDATE job_queue SET status = 'completed', locked_until_ms = NULL, updated_at = CURRENT_TIMESTAMP WHERE guid = ? AND status = 'active' AND attempts = ?"
        };

        let affected = sqlx::query(sql)
            .bind(leased.id.to_string())
            .bind(i64::from(leased.attempts))
            .execute(&self.db)
            .await?
            .rows_affected();

        if affected == 0 {
            warn!(job_id = %leased.id, "Job completed after its lease was recovered");
        }
        Ok(())
    }

    /// Record a failed attempt and decide whether the job is retried
    pub async fn fail(&self, leased: &QueuedJob, reason: &str) -> Result<FailureDisposition> {
        let id = leased.id.to_string();
        let attempts = i64::from(leased.attempts);

        let (disposition, result) = if leased.attempts < leased.max_attempts {
            let delay = backoff_delay(leased.backoff_ms.max(0) as u64, leased.attempts);
            let result = sqlx::query(
                r#"
                UPDATE job_queue
                SET status = 'waiting', run_after_ms = ?, locked_until_ms = NULL,
                    last_error = ?, updated_at = CURRENT_TIMESTAMP
                WHERE guid = ? AND status = 'active' AND attempts = ?
                "#,
            )
            .bind(now_ms().saturating_add(duration_ms(delay)))
            .bind(reason)
            .bind(&id)
            .bind(attempts)
            .execute(&self.db)
            .await?;
            (FailureDisposition::Retrying { delay }, result)
        } else if leased.remove_on_fail {
            let result = sqlx::query(
                "DELETE FROM job_queue WHERE guid = ? AND status = 'active' AND attempts = ?",
            )
            .bind(&id)
            .bind(attempts)
            .execute(&self.db)
            .await?;
            (FailureDisposition::Discarded, result)
        } else {
            let result = sqlx::query(
                r#"
                UPDATE job_queue
                SET status = 'failed', locked_until_ms = NULL,
                    last_error = ?, updated_at = CURRENT_TIMESTAMP
                WHERE guid = ? AND status = 'active' AND attempts = ?
                "#,
            )
            .bind(reason)
            .bind(&id)
            .bind(attempts)
            .execute(&self.db)
            .await?;
            (FailureDisposition::Failed, result)
        };

        if result.rows_affected() == 0 {
            return Ok(FailureDisposition::LeaseLost);
        }
        Ok(disposition)
    }

    /// Return jobs whose lease expired to the queue, or fail them when out of attempts
    pub async fn recover_stalled(&self) -> Result<u64> {
        let now = now_ms();
        let mut tx = self.db.begin().await?;

        let requeued = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'waiting', locked_until_ms = NULL, run_after_ms = ?,
                last_error = 'lease expired', updated_at = CURRENT_TIMESTAMP
            WHERE status = 'active' AND locked_until_ms < ? AND attempts < max_attempts
            "#,
        )
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let discarded = sqlx::query(
            r#"
            DELETE FROM job_queue
            WHERE status = 'active' AND locked_until_ms < ? AND remove_on_fail = 1
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let failed = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'failed', locked_until_ms = NULL,
                last_error = 'lease expired', updated_at = CURRENT_TIMESTAMP
            WHERE status = 'active' AND locked_until_ms < ?
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        let recovered = requeued + discarded + failed;
        if recovered > 0 {
            warn!(requeued, discarded, failed, "Recovered stalled jobs");
        }
        Ok(recovered)
    }

    /// Queue depth by status
    pub async fn counts(&self) -> Result<QueueCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM job_queue GROUP BY status")
            .fetch_all(&self.db)
            .await?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match status.as_str() {
                "waiting" => counts.waiting = n,
                "active" => counts.active = n,
                "failed" => counts.failed = n,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Jobs retained after exhausting their attempts
    pub async fn failed_jobs(&self) -> Result<Vec<FailedJob>> {
        let rows = sqlx::query(
            "SELECT guid, kind, attempts, last_error FROM job_queue WHERE status = 'failed' ORDER BY updated_at",
        )
        .fetch_all(&self.db)
        .await?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("guid")?;
                Ok(FailedJob {
                    id: Uuid::parse_str(&id)?,
                    kind: row.try_get("kind")?,
                    attempts: row.try_get("attempts")?,
                    last_error: row.try_get("last_error")?,
                })
            })
            .collect()
    }

    /// Manually replay a failed job with a fresh attempt budget
    pub async fn retry_failed(&self, job_id: Uuid) -> Result<()> {
        let affected = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'waiting', attempts = 0, run_after_ms = ?, updated_at = CURRENT_TIMESTAMP
            WHERE guid = ? AND status = 'failed'
            "#,
        )
        .bind(now_ms())
        .bind(job_id.to_string())
        .execute(&self.db)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(Error::NotFound(format!("Failed job {}", job_id)));
        }
        info!(job_id = %job_id, "Failed job requeued for replay");
        Ok(())
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
