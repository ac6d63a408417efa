//! System statistics handler. Admin only, cache-first.

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::Utc;

use crate::auth::AuthContext;
use crate::errors::ApiError;
use crate::AppState;

/// `GET /api/stats` -- totals plus per-owner storage.
pub async fn get_stats(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Response, ApiError> {
    if !auth.is_admin() {
        return Err(ApiError::forbidden("stats are admin-only"));
    }

    if let Some(stats) = state.cache.get_stats() {
        return Ok(Json(stats).into_response());
    }

    let totals = state.metadata.stats_totals().await?;
    let by_owner = state.metadata.storage_by_owner(Utc::now()).await?;

    let mut stats = serde_json::to_value(totals).map_err(anyhow::Error::from)?;
    stats["storage_by_owner"] =
        serde_json::to_value(by_owner).map_err(anyhow::Error::from)?;

    state.cache.put_stats(stats.clone());
    Ok(Json(stats).into_response())
}
