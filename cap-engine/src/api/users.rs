//! Per-user queries and engagement intake

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use cap_common::CapLevel;
use serde::Serialize;
use uuid::Uuid;

use crate::engagement::EngagementDelta;
use crate::error::ApiResult;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct UserTierResponse {
    pub user_id: Uuid,
    pub tier: CapLevel,
    pub verified: bool,
}

#[derive(Debug, Serialize)]
pub struct UserScoreResponse {
    pub user_id: Uuid,
    pub accumulated_score: i64,
}

/// GET /api/users/:id/tier
pub async fn get_user_tier(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<UserTierResponse>> {
    let user = state.engagement.user(user_id).await?;
    Ok(Json(UserTierResponse {
        user_id,
        tier: user.tier,
        verified: user.verified,
    }))
}

/// GET /api/users/:id/score
pub async fn get_user_score(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<UserScoreResponse>> {
    let accumulated_score = state.engagement.current_score(user_id).await?;
    Ok(Json(UserScoreResponse {
        user_id,
        accumulated_score,
    }))
}

/// POST /api/users/:id/engagement
///
/// Body: `{"kind": "score", "amount": 5}` or `{"kind": "volunteer_hours", "amount": 2}`
pub async fn record_engagement(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(delta): Json<EngagementDelta>,
) -> ApiResult<StatusCode> {
    state.engagement.apply(user_id, delta).await?;
    Ok(StatusCode::NO_CONTENT)
}
