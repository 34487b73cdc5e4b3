//! Monetization trigger and ledger query

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cap_common::db::RevenueLedgerEntry;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::queue::{Job, JobOptions};
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct DistributeParams {
    /// Enqueue the distribution instead of running it in the request
    #[serde(default, rename = "async")]
    pub queued: bool,
}

/// POST /api/listings/:id/distribute[?async=true]
pub async fn distribute_revenue(
    State(state): State<AppState>,
    Path(listing_id): Path<Uuid>,
    Query(params): Query<DistributeParams>,
) -> ApiResult<Response> {
    if params.queued {
        // Fail fast on unknown listings rather than burning queue attempts
        state.revenue.listing(listing_id).await?;
        let job_id = state
            .queue
            .enqueue(
                &Job::DistributeRevenue { listing_id },
                JobOptions::from_config(&state.config),
            )
            .await?;
        return Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job_id }))).into_response());
    }

    let outcome = state.revenue.distribute(listing_id).await?;
    Ok(Json(outcome).into_response())
}

/// GET /api/listings/:id/ledger
pub async fn get_ledger(
    State(state): State<AppState>,
    Path(listing_id): Path<Uuid>,
) -> ApiResult<Json<Vec<RevenueLedgerEntry>>> {
    Ok(Json(state.revenue.ledger(listing_id).await?))
}
