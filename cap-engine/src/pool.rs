//! Worker pool and job dispatch
//!
//! Every `Job` variant is handled by exactly one arm of `JobDispatcher::dispatch`.
//! Workers lease jobs from the durable queue, bound each run with the job
//! timeout and report the result back so the queue can retry or retain it.

use crate::config::EngineConfig;
use crate::queue::{FailureDisposition, Job, JobQueue, QueuedJob};
use crate::revenue::{DistributionOutcome, RevenueDistributor};
use crate::worker::EvaluationWorker;
use cap_common::{Error, Result};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Routes each job kind to its handler
pub struct JobDispatcher {
    evaluator: Arc<EvaluationWorker>,
    revenue: RevenueDistributor,
}

impl JobDispatcher {
    pub fn new(evaluator: Arc<EvaluationWorker>, revenue: RevenueDistributor) -> Self {
        Self { evaluator, revenue }
    }

    pub async fn dispatch(&self, job: &Job) -> Result<()> {
        match job {
            Job::EvaluateBatch(batch) => {
                let report = self.evaluator.process_batch(batch).await?;
                if report.is_clean() {
                    return Ok(());
                }
                let ids: Vec<String> = report.failed_users.iter().map(|id| id.to_string()).collect();
                Err(Error::Internal(format!(
                    "{} of {} users failed in batch {}: {}",
                    report.failed_users.len(),
                    batch.user_ids.len(),
                    batch.batch_id,
                    ids.join(", ")
                )))
            }
            Job::DistributeRevenue { listing_id } => {
                match self.revenue.distribute(*listing_id).await? {
                    DistributionOutcome::Distributed(report) => {
                        debug!(listing_id = %listing_id, posts = report.entries.len(), "Distribution job done");
                    }
                    DistributionOutcome::NoOp { reason } => {
                        debug!(listing_id = %listing_id, ?reason, "Distribution job was a no-op");
                    }
                }
                Ok(())
            }
        }
    }
}

pub struct WorkerPool {
    queue: JobQueue,
    dispatcher: Arc<JobDispatcher>,
    worker_count: usize,
    poll_interval: Duration,
    job_timeout: Duration,
}

impl WorkerPool {
    pub fn new(queue: JobQueue, dispatcher: Arc<JobDispatcher>, config: &EngineConfig) -> Self {
        Self {
            queue,
            dispatcher,
            worker_count: config.worker_count.max(1),
            poll_interval: config.worker_poll_interval,
            job_timeout: config.job_timeout,
        }
    }

    /// Lease window; slightly longer than the timeout so a live worker reports first
    fn lease(&self) -> Duration {
        self.job_timeout + self.poll_interval
    }

    /// Claim and run one job. Returns false when nothing was runnable.
    pub async fn run_one(&self) -> Result<bool> {
        let leased = match self.queue.claim(self.lease()).await {
            Ok(Some(leased)) => leased,
            Ok(None) => return Ok(false),
            // Undecodable payload: already marked failed by the queue
            Err(Error::Queue(msg)) => {
                error!("Skipping job: {}", msg);
                return Ok(true);
            }
            Err(e) => return Err(e),
        };

        self.execute(&leased).await?;
        Ok(true)
    }

    async fn execute(&self, leased: &QueuedJob) -> Result<()> {
        let kind = leased.job.kind();
        debug!(job_id = %leased.id, kind, attempt = leased.attempts, "Running job");

        let result = match tokio::time::timeout(self.job_timeout, self.dispatcher.dispatch(&leased.job)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Queue(format!(
                "timed out after {}s",
                self.job_timeout.as_secs()
            ))),
        };

        match result {
            Ok(()) => self.queue.complete(leased).await,
            Err(e) => {
                let reason = e.to_string();
                match self.queue.fail(leased, &reason).await? {
                    FailureDisposition::Retrying { delay } => warn!(
                        job_id = %leased.id,
                        kind,
                        attempt = leased.attempts,
                        max_attempts = leased.max_attempts,
                        "Job failed, retrying in {}ms: {}",
                        delay.as_millis(),
                        reason
                    ),
                    FailureDisposition::Failed => error!(
                        job_id = %leased.id,
                        kind,
                        "Job failed permanently, retained for replay: {}",
                        reason
                    ),
                    FailureDisposition::Discarded => error!(
                        job_id = %leased.id,
                        kind,
                        "Job failed permanently and was discarded: {}",
                        reason
                    ),
                    FailureDisposition::LeaseLost => warn!(
                        job_id = %leased.id,
                        kind,
                        "Job failed after its lease was recovered: {}",
                        reason
                    ),
                }
                Ok(())
            }
        }
    }

    /// Process runnable jobs with `worker_count` concurrent loops until none remain
    ///
    /// Jobs waiting on a retry backoff are left in the queue.
    pub async fn drain(&self) -> Result<usize> {
        let results: Vec<Result<usize>> = stream::iter(0..self.worker_count)
            .map(|_| async move {
                let mut processed = 0;
                while self.run_one().await? {
                    processed += 1;
                }
                Ok(processed)
            })
            .buffer_unordered(self.worker_count)
            .collect()
            .await;

        let mut total = 0;
        for result in results {
            total += result?;
        }
        Ok(total)
    }

    /// Spawn the worker loops and the stalled-job reaper
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(
            "Starting WorkerPool ({} workers, job timeout: {}s)",
            self.worker_count,
            self.job_timeout.as_secs()
        );

        let mut handles = Vec::with_capacity(self.worker_count + 1);
        for worker_id in 0..self.worker_count {
            let pool = Arc::clone(&self);
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    let idle = match pool.run_one().await {
                        Ok(processed) => !processed,
                        Err(e) => {
                            error!(worker_id, "Worker loop error: {}", e);
                            true
                        }
                    };
                    if idle {
                        tokio::select! {
                            _ = tokio::time::sleep(pool.poll_interval) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                }
                debug!(worker_id, "Worker stopped");
            }));
        }

        let pool = Arc::clone(&self);
        let mut shutdown = shutdown;
        handles.push(tokio::spawn(async move {
            let mut timer = interval(pool.job_timeout.max(Duration::from_secs(1)));
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    // First tick fires immediately: recovers leases left by a previous run
                    _ = timer.tick() => {
                        if let Err(e) = pool.queue.recover_stalled().await {
                            error!("Stalled job recovery failed: {}", e);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));

        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::EventBusNotifier;
    use crate::queue::{EvaluationBatch, JobOptions};
    use crate::registry::TierRegistry;
    use crate::test_support::{insert_listing, insert_post, insert_user, memory_db, set_metrics};
    use cap_common::events::EventBus;
    use cap_common::CapLevel;
    use rust_decimal::Decimal;
    use sqlx::SqlitePool;
    use uuid::Uuid;

    fn pool_for(db: &SqlitePool, worker_count: usize) -> WorkerPool {
        let bus = EventBus::new(16);
        let registry = TierRegistry::new(db.clone());
        let evaluator = Arc::new(EvaluationWorker::new(
            db.clone(),
            registry,
            Arc::new(EventBusNotifier::new(bus.clone())),
            bus.clone(),
            Duration::from_millis(100),
        ));
        let dispatcher = Arc::new(JobDispatcher::new(
            evaluator,
            RevenueDistributor::new(db.clone(), bus, 5),
        ));
        let config = EngineConfig {
            worker_count,
            ..EngineConfig::default()
        };
        WorkerPool::new(JobQueue::new(db.clone()), dispatcher, &config)
    }

    #[tokio::test]
    async fn test_drain_runs_both_job_kinds() {
        let db = memory_db().await;
        TierRegistry::new(db.clone()).seed_defaults().await.unwrap();
        let user = insert_user(&db, CapLevel::None, false).await;
        set_metrics(&db, user, 60, 0).await;
        let author = insert_user(&db, CapLevel::Green, false).await;
        insert_post(&db, author, 0).await;
        let listing = insert_listing(&db, Decimal::from(100)).await;

        let queue = JobQueue::new(db.clone());
        queue
            .enqueue_all(
                &[
                    Job::EvaluateBatch(EvaluationBatch {
                        batch_id: Uuid::new_v4(),
                        cycle_id: Uuid::new_v4(),
                        user_ids: vec![user],
                    }),
                    Job::DistributeRevenue { listing_id: listing },
                ],
                JobOptions::default(),
            )
            .await
            .unwrap();

        let processed = pool_for(&db, 1).drain().await.unwrap();
        assert_eq!(processed, 2);
        assert_eq!(queue.counts().await.unwrap(), Default::default());

        let tier: String = sqlx::query_scalar("SELECT tier FROM users WHERE guid = ?")
            .bind(user.to_string())
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(tier, "YELLOW");
    }

    #[tokio::test]
    async fn test_partial_batch_failure_is_retried_then_retained() {
        let db = memory_db().await;
        TierRegistry::new(db.clone()).seed_defaults().await.unwrap();
        let queue = JobQueue::new(db.clone());
        queue
            .enqueue(
                &Job::EvaluateBatch(EvaluationBatch {
                    batch_id: Uuid::new_v4(),
                    cycle_id: Uuid::new_v4(),
                    user_ids: vec![Uuid::new_v4()],
                }),
                JobOptions {
                    max_attempts: 2,
                    backoff: Duration::ZERO,
                    ..JobOptions::default()
                },
            )
            .await
            .unwrap();

        let processed = pool_for(&db, 1).drain().await.unwrap();
        assert_eq!(processed, 2);

        let failed = queue.failed_jobs().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].last_error.as_deref().unwrap_or_default().contains("1 of 1 users failed"));
    }
}
