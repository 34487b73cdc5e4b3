//! Batch scheduler
//!
//! Periodically snapshots every scored user, partitions the snapshot into
//! fixed-size batches and enqueues one durable evaluation job per batch.
//! Ticks are independent: a failed tick is logged and the next one starts
//! from scratch.

use crate::config::EngineConfig;
use crate::engagement::EngagementStore;
use crate::queue::{EvaluationBatch, Job, JobOptions, JobQueue};
use cap_common::events::{EngineEvent, EventBus};
use cap_common::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Split a snapshot into consecutive chunks of at most `batch_size`
///
/// Every user appears in exactly one batch, in snapshot order.
pub fn partition(users: &[Uuid], batch_size: usize) -> Vec<Vec<Uuid>> {
    users
        .chunks(batch_size.max(1))
        .map(<[Uuid]>::to_vec)
        .collect()
}

/// Result of one scheduler tick
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub cycle_id: Uuid,
    pub user_count: usize,
    pub batch_ids: Vec<Uuid>,
    pub job_ids: Vec<Uuid>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.batch_ids.is_empty()
    }
}

pub struct BatchScheduler {
    engagement: EngagementStore,
    queue: JobQueue,
    event_bus: EventBus,
    interval: Duration,
    batch_size: usize,
    job_options: JobOptions,
}

impl BatchScheduler {
    pub fn new(
        engagement: EngagementStore,
        queue: JobQueue,
        event_bus: EventBus,
        config: &EngineConfig,
    ) -> Self {
        Self {
            engagement,
            queue,
            event_bus,
            interval: config.evaluation_interval,
            batch_size: config.batch_size,
            job_options: JobOptions::from_config(config),
        }
    }

    /// Run one tick: snapshot, partition, enqueue all batches atomically
    pub async fn tick(&self) -> Result<TickReport> {
        let cycle_id = Uuid::new_v4();
        let users = self.engagement.snapshot_scored_users().await?;

        if users.is_empty() {
            info!(cycle_id = %cycle_id, "No scored users, nothing to schedule");
            return Ok(TickReport {
                cycle_id,
                user_count: 0,
                batch_ids: Vec::new(),
                job_ids: Vec::new(),
            });
        }

        let jobs: Vec<Job> = partition(&users, self.batch_size)
            .into_iter()
            .map(|user_ids| {
                Job::EvaluateBatch(EvaluationBatch {
                    batch_id: Uuid::new_v4(),
                    cycle_id,
                    user_ids,
                })
            })
            .collect();

        let batch_ids = jobs
            .iter()
            .filter_map(|job| match job {
                Job::EvaluateBatch(batch) => Some(batch.batch_id),
                _ => None,
            })
            .collect::<Vec<_>>();

        let job_ids = self.queue.enqueue_all(&jobs, self.job_options).await?;

        info!(
            cycle_id = %cycle_id,
            users = users.len(),
            batches = batch_ids.len(),
            "Evaluation cycle scheduled"
        );
        self.event_bus.emit_lossy(EngineEvent::EvaluationCycleScheduled {
            cycle_id,
            user_count: users.len(),
            batch_count: batch_ids.len(),
            timestamp: cap_common::time::now(),
        });

        Ok(TickReport {
            cycle_id,
            user_count: users.len(),
            batch_ids,
            job_ids,
        })
    }

    /// Fire one tick outside the normal period
    pub async fn trigger_now(&self) -> Result<TickReport> {
        info!("Manual evaluation trigger");
        self.tick().await
    }

    /// Spawn the periodic loop; stops when `shutdown` flips to true
    pub fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        info!(
            "Starting BatchScheduler (interval: {}s, batch size: {})",
            self.interval.as_secs(),
            self.batch_size
        );

        tokio::spawn(async move {
            let mut timer = interval(self.interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick of a tokio interval completes immediately
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = self.tick().await {
                            error!("BatchScheduler: tick failed: {}", e);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("BatchScheduler: shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engagement::EngagementDelta;
    use crate::test_support::{insert_user, memory_db};
    use cap_common::CapLevel;
    use std::collections::HashSet;

    #[test]
    fn test_partition_sizes() {
        let users: Vec<Uuid> = (0..1200).map(|_| Uuid::new_v4()).collect();
        let batches = partition(&users, 500);

        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![500, 500, 200]);

        let union: HashSet<Uuid> = batches.iter().flatten().copied().collect();
        assert_eq!(union.len(), users.len());
        assert_eq!(union, users.iter().copied().collect::<HashSet<_>>());
    }

    #[test]
    fn test_partition_exact_multiple_and_empty() {
        let users: Vec<Uuid> = (0..1000).map(|_| Uuid::new_v4()).collect();
        let sizes: Vec<usize> = partition(&users, 500).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![500, 500]);

        assert!(partition(&[], 500).is_empty());
    }

    #[tokio::test]
    async fn test_tick_enqueues_one_job_per_batch() {
        let db = memory_db().await;
        let engagement = EngagementStore::new(db.clone());
        for _ in 0..5 {
            let user = insert_user(&db, CapLevel::None, false).await;
            engagement.apply(user, EngagementDelta::Score(3)).await.unwrap();
        }

        let queue = JobQueue::new(db.clone());
        let config = EngineConfig {
            batch_size: 2,
            ..EngineConfig::default()
        };
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let scheduler = BatchScheduler::new(engagement, queue.clone(), bus, &config);

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.user_count, 5);
        assert_eq!(report.batch_ids.len(), 3);
        assert_eq!(queue.counts().await.unwrap().waiting, 3);

        match rx.recv().await.unwrap() {
            EngineEvent::EvaluationCycleScheduled { batch_count, .. } => assert_eq!(batch_count, 3),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_snapshot_is_noop() {
        let db = memory_db().await;
        let queue = JobQueue::new(db.clone());
        let scheduler = BatchScheduler::new(
            EngagementStore::new(db),
            queue.clone(),
            EventBus::new(4),
            &EngineConfig::default(),
        );

        let report = scheduler.trigger_now().await.unwrap();
        assert!(report.is_empty());
        assert_eq!(queue.counts().await.unwrap().waiting, 0);
    }
}
