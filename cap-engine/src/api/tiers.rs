//! Tier registry endpoints

use axum::{
    extract::{Path, State},
    Json,
};
use cap_common::db::TierDefinition;
use cap_common::CapLevel;

use crate::error::{ApiError, ApiResult};
use crate::registry::SeedReport;
use crate::AppState;

/// GET /api/tiers
pub async fn list_tiers(State(state): State<AppState>) -> ApiResult<Json<Vec<TierDefinition>>> {
    Ok(Json(state.registry.list().await?))
}

/// GET /api/tiers/:tier
pub async fn get_tier_definition(
    State(state): State<AppState>,
    Path(tier): Path<String>,
) -> ApiResult<Json<TierDefinition>> {
    let tier = CapLevel::parse(&tier)
        .ok_or_else(|| ApiError::BadRequest(format!("Unknown tier '{}'", tier)))?;
    Ok(Json(state.registry.get(tier).await?))
}

/// POST /api/admin/tiers/seed
///
/// Upserts the canonical definitions; safe to repeat.
pub async fn seed_tiers(State(state): State<AppState>) -> ApiResult<Json<SeedReport>> {
    Ok(Json(state.registry.seed_defaults().await?))
}

/// POST /api/admin/tiers/reset
pub async fn reset_tiers(State(state): State<AppState>) -> ApiResult<Json<SeedReport>> {
    Ok(Json(state.registry.reset().await?))
}
