//! Upload-token and dashboard-credential handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::require_bucket;
use crate::auth::{self, AuthContext};
use crate::cache::TokenValidity;
use crate::errors::ApiError;
use crate::ids;
use crate::metadata::store::UploadTokenRecord;
use crate::AppState;

// -- Upload tokens ------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct CreateTokenRequest {
    #[serde(default)]
    pub expires_in: Option<String>,
    #[serde(default)]
    pub max_uploads: Option<i64>,
}

/// `POST /api/buckets/{id}/tokens` -- issue an upload token.
pub async fn create_upload_token(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Extension(auth): Extension<AuthContext>,
    body: Option<Json<CreateTokenRequest>>,
) -> Result<Response, ApiError> {
    let bucket = require_bucket(&state, &id, false).await?;
    if !auth.can_manage(&bucket.owner) {
        return Err(ApiError::forbidden("you do not manage this bucket"));
    }

    let body = body.map(|Json(b)| b).unwrap_or_default();
    if matches!(body.max_uploads, Some(max) if max < 1) {
        return Err(ApiError::validation("max_uploads must be at least 1"));
    }
    let expires_at =
        ids::parse_expiry(body.expires_in.as_deref(), ids::ExpiryKind::UploadToken)
            .map_err(ApiError::validation)?
            .ok_or_else(|| ApiError::validation("upload tokens must have an expiry"))?;

    let record = UploadTokenRecord {
        token: ids::generate_upload_token(),
        bucket_id: id,
        created_at: crate::metadata::store::now(),
        expires_at,
        max_uploads: body.max_uploads,
        uploads_used: 0,
    };
    state.metadata.insert_upload_token(record.clone()).await?;
    state.cache.invalidate_stats();

    Ok((StatusCode::CREATED, Json(record)).into_response())
}

/// Cache-first upload-token validation. Expired or exhausted tokens are
/// cached as invalid; absence is never cached.
pub async fn validate_token_cached(
    state: &AppState,
    token: &str,
) -> Result<TokenValidity, ApiError> {
    if let Some(validity) = state.cache.get_upload_token(token) {
        return Ok(validity);
    }

    let Some(record) = state.metadata.get_upload_token(token).await? else {
        return Ok(TokenValidity {
            bucket_id: String::new(),
            is_valid: false,
        });
    };

    let validity = TokenValidity {
        bucket_id: record.bucket_id.clone(),
        is_valid: record.is_valid(Utc::now()),
    };
    state.cache.put_upload_token(token, validity.clone());
    Ok(validity)
}

// -- Dashboard credentials ----------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct DashboardTokenRequest {
    #[serde(default)]
    pub expires_in: Option<String>,
}

#[derive(Debug, Serialize)]
struct DashboardTokenResponse {
    token: String,
    scope: &'static str,
    expires_at: chrono::DateTime<Utc>,
}

/// `POST /api/tokens/dashboard` -- issue a short-lived admin credential.
///
/// Expiry defaults to one hour and is hard-capped at 24 hours.
pub async fn create_dashboard_token(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    body: Option<Json<DashboardTokenRequest>>,
) -> Result<Response, ApiError> {
    if !auth.is_admin() {
        return Err(ApiError::forbidden("dashboard credentials are admin-issued"));
    }

    let body = body.map(|Json(b)| b).unwrap_or_default();
    let expires_at = ids::parse_expiry(body.expires_in.as_deref(), ids::ExpiryKind::Dashboard)
        .map_err(ApiError::validation)?
        .ok_or_else(|| ApiError::validation("dashboard credentials must expire"))?;

    let token =
        auth::issue_dashboard_credential(state.config.auth.signing_secret(), expires_at)?;

    Ok((
        StatusCode::CREATED,
        Json(DashboardTokenResponse {
            token,
            scope: "admin",
            expires_at,
        }),
    )
        .into_response())
}

#[derive(Debug, Serialize)]
struct DashboardMeResponse {
    scope: String,
    expires_at: chrono::DateTime<Utc>,
    remaining_seconds: i64,
}

/// `GET /api/tokens/dashboard/me` -- introspect the presented credential.
///
/// Missing credential → 401; a credential that is not a valid dashboard
/// credential → 403.
pub async fn dashboard_me(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let Some(credential) = bearer else {
        return Err(ApiError::Unauthorized);
    };

    let claims =
        auth::validate_dashboard_credential(state.config.auth.signing_secret(), credential)
            .ok_or_else(|| ApiError::forbidden("not a valid dashboard credential"))?;

    let expires_at = chrono::DateTime::from_timestamp(claims.exp, 0)
        .unwrap_or_else(Utc::now);
    Ok(Json(DashboardMeResponse {
        scope: claims.scope,
        expires_at,
        remaining_seconds: (expires_at - Utc::now()).num_seconds().max(0),
    })
    .into_response())
}
