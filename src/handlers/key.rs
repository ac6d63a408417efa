//! API-key handlers. Admin only.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::{self, AuthContext};
use crate::errors::ApiError;
use crate::ids;
use crate::metadata::store::ApiKeyRecord;
use crate::AppState;

fn require_admin(auth: &AuthContext) -> Result<(), ApiError> {
    if auth.is_admin() {
        Ok(())
    } else {
        Err(ApiError::forbidden("API keys are managed by the admin"))
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
struct CreatedKeyResponse {
    /// The full key. Returned exactly once, at creation.
    key: String,
    prefix: String,
    name: String,
    created_at: chrono::DateTime<Utc>,
}

/// `POST /api/keys` -- mint an API key. The full key appears only here.
pub async fn create_key(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<CreateKeyRequest>,
) -> Result<Response, ApiError> {
    require_admin(&auth)?;

    let name = body.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::validation("key name must not be blank"));
    }

    let (full, prefix, secret) = ids::generate_api_key();
    let record = ApiKeyRecord {
        prefix: prefix.clone(),
        hashed_secret: auth::hash_secret(&secret),
        name: name.clone(),
        created_at: crate::metadata::store::now(),
        last_used_at: None,
    };
    state.metadata.insert_api_key(record.clone()).await?;
    state.cache.invalidate_stats();
    info!(prefix = %prefix, name = %name, "api key created");

    Ok((
        StatusCode::CREATED,
        Json(CreatedKeyResponse {
            key: full,
            prefix,
            name,
            created_at: record.created_at,
        }),
    )
        .into_response())
}

/// `GET /api/keys` -- list keys (prefixes and metadata only).
pub async fn list_keys(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Response, ApiError> {
    require_admin(&auth)?;
    let keys = state.metadata.list_api_keys().await?;
    Ok(Json(serde_json::json!({ "keys": keys })).into_response())
}

/// `DELETE /api/keys/{prefix}` -- revoke a key.
///
/// Buckets the key created are preserved; only the credential dies.
pub async fn delete_key(
    State(state): State<Arc<AppState>>,
    Path(prefix): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Response, ApiError> {
    require_admin(&auth)?;
    if !state.metadata.delete_api_key(&prefix).await? {
        return Err(ApiError::not_found("api key"));
    }
    state.cache.invalidate_stats();
    info!(prefix = %prefix, "api key deleted");
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `GET /api/keys/{prefix}/usage` -- aggregates over the key's buckets.
pub async fn key_usage(
    State(state): State<Arc<AppState>>,
    Path(prefix): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Response, ApiError> {
    require_admin(&auth)?;
    if state.metadata.get_api_key(&prefix).await?.is_none() {
        return Err(ApiError::not_found("api key"));
    }
    let usage = state.metadata.key_usage(&prefix).await?;
    Ok(Json(usage).into_response())
}
