//! Operator endpoints: manual evaluation trigger and queue inspection

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::queue::{FailedJob, QueueCounts};
use crate::scheduler::TickReport;
use crate::AppState;

/// POST /api/admin/evaluate
///
/// Fires one scheduler tick immediately.
pub async fn trigger_evaluation(State(state): State<AppState>) -> ApiResult<Json<TickReport>> {
    Ok(Json(state.scheduler.trigger_now().await?))
}

#[derive(Debug, Serialize)]
pub struct QueueStatus {
    pub counts: QueueCounts,
    pub failed: Vec<FailedJob>,
}

/// GET /api/admin/queue
pub async fn queue_status(State(state): State<AppState>) -> ApiResult<Json<QueueStatus>> {
    Ok(Json(QueueStatus {
        counts: state.queue.counts().await?,
        failed: state.queue.failed_jobs().await?,
    }))
}

/// POST /api/admin/queue/:job_id/retry
pub async fn retry_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.queue.retry_failed(job_id).await?;
    Ok(StatusCode::ACCEPTED)
}
