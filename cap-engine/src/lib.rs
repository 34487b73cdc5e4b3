//! cap-engine library
//!
//! Cap-level progression and ad-revenue distribution: a periodic scheduler
//! batches scored users onto a durable queue, a worker pool converts scores
//! into tiers, and the revenue distributor pays post authors from monetized
//! listings according to their tier.

use axum::Router;
use cap_common::events::EventBus;
use sqlx::SqlitePool;
use std::sync::Arc;

pub mod api;
pub mod config;
pub mod engagement;
pub mod error;
pub mod notify;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod revenue;
pub mod scheduler;
pub mod worker;

pub use config::EngineConfig;
pub use error::{ApiError, ApiResult};

use engagement::EngagementStore;
use notify::EventBusNotifier;
use pool::{JobDispatcher, WorkerPool};
use queue::JobQueue;
use registry::TierRegistry;
use revenue::RevenueDistributor;
use scheduler::BatchScheduler;
use worker::EvaluationWorker;

/// Application state shared across HTTP handlers and background services
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub config: EngineConfig,
    pub event_bus: EventBus,
    pub registry: TierRegistry,
    pub engagement: EngagementStore,
    pub queue: JobQueue,
    pub scheduler: Arc<BatchScheduler>,
    pub revenue: RevenueDistributor,
}

impl AppState {
    /// Wire every component onto one database pool and event bus
    pub fn new(db: SqlitePool, config: EngineConfig, event_bus: EventBus) -> Self {
        let registry = TierRegistry::new(db.clone());
        let engagement = EngagementStore::new(db.clone());
        let queue = JobQueue::new(db.clone());
        let scheduler = Arc::new(BatchScheduler::new(
            engagement.clone(),
            queue.clone(),
            event_bus.clone(),
            &config,
        ));
        let revenue = RevenueDistributor::new(db.clone(), event_bus.clone(), config.revenue_post_cap)
            .with_lock_wait(config.lock_wait);

        Self {
            db,
            config,
            event_bus,
            registry,
            engagement,
            queue,
            scheduler,
            revenue,
        }
    }

    /// Evaluation worker publishing tier upgrades on the event bus
    pub fn evaluation_worker(&self) -> EvaluationWorker {
        EvaluationWorker::new(
            self.db.clone(),
            self.registry.clone(),
            Arc::new(EventBusNotifier::new(self.event_bus.clone())),
            self.event_bus.clone(),
            self.config.notification_timeout,
        )
        .with_lock_wait(self.config.lock_wait)
    }

    /// Worker pool dispatching every job kind
    pub fn worker_pool(&self) -> WorkerPool {
        let dispatcher = JobDispatcher::new(Arc::new(self.evaluation_worker()), self.revenue.clone());
        WorkerPool::new(self.queue.clone(), Arc::new(dispatcher), &self.config)
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::{get, post};

    let admin = Router::new()
        .route("/api/admin/tiers/seed", post(api::seed_tiers))
        .route("/api/admin/tiers/reset", post(api::reset_tiers))
        .route("/api/admin/evaluate", post(api::trigger_evaluation))
        .route("/api/admin/queue", get(api::queue_status))
        .route("/api/admin/queue/:job_id/retry", post(api::retry_job));

    let query = Router::new()
        .route("/api/tiers", get(api::list_tiers))
        .route("/api/tiers/:tier", get(api::get_tier_definition))
        .route("/api/users/:id/tier", get(api::get_user_tier))
        .route("/api/users/:id/score", get(api::get_user_score))
        .route("/api/users/:id/engagement", post(api::record_engagement))
        .route("/api/listings/:id/distribute", post(api::distribute_revenue))
        .route("/api/listings/:id/ledger", get(api::get_ledger))
        .route("/api/events", get(api::event_stream))
        .route("/api/buildinfo", get(api::get_build_info));

    Router::new()
        .merge(admin)
        .merge(query)
        .merge(api::health_routes())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
