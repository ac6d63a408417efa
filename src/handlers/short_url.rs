//! Short-URL handlers: public redirect resolution and deletion.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use chrono::Utc;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::auth::AuthContext;
use crate::cache::ShortResolution;
use crate::errors::ApiError;
use crate::AppState;

/// Percent-encoding for redirect targets: keep `/` and path-safe chars.
const REDIRECT_PATH_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'.')
    .remove(b'_')
    .remove(b'-');

/// Resolve a code into `(bucket_id, file_path)`, cache-first.
///
/// The owning bucket's expiry is cached beside the target and re-checked
/// on every hit, so an unsweeped expired bucket never serves a redirect.
async fn resolve(state: &AppState, code: &str) -> Result<Option<ShortResolution>, ApiError> {
    let now = Utc::now();

    if let Some(resolution) = state.cache.get_short_url(code) {
        if matches!(resolution.bucket_expires_at, Some(at) if at <= now) {
            return Ok(None);
        }
        return Ok(Some(resolution));
    }

    let Some(row) = state.metadata.get_short_url(code).await? else {
        return Ok(None);
    };
    let Some(bucket) = state.metadata.get_bucket(&row.bucket_id).await? else {
        return Ok(None);
    };
    if bucket.is_expired(now) {
        return Ok(None);
    }

    let resolution = ShortResolution {
        bucket_id: row.bucket_id,
        file_path: row.file_path,
        bucket_expires_at: bucket.expires_at,
    };
    state.cache.put_short_url(code, resolution.clone());
    Ok(Some(resolution))
}

/// `GET /s/{code}` -- 302 to the file's content URL.
pub async fn redirect_short_url(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Response, ApiError> {
    let resolution = resolve(&state, &code)
        .await?
        .ok_or_else(|| ApiError::not_found("short code"))?;

    let encoded_path =
        utf8_percent_encode(&resolution.file_path, REDIRECT_PATH_SET).to_string();
    let target = format!(
        "/api/buckets/{}/files/{}/content",
        resolution.bucket_id, encoded_path
    );

    // 302 Found, by hand: axum's Redirect constructors only cover 303/307/308.
    let mut response = StatusCode::FOUND.into_response();
    response.headers_mut().insert(
        "location",
        HeaderValue::from_str(&target).map_err(anyhow::Error::from)?,
    );
    Ok(response)
}

/// `DELETE /api/short/{code}` -- remove the reverse row only; the file
/// keeps existing (and keeps its stored code).
pub async fn delete_short_url(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Response, ApiError> {
    if auth.is_public() {
        return Err(ApiError::forbidden("a credential is required"));
    }

    let row = state
        .metadata
        .get_short_url(&code)
        .await?
        .ok_or_else(|| ApiError::not_found("short code"))?;

    let manages = match state.metadata.get_bucket(&row.bucket_id).await? {
        Some(bucket) => auth.can_manage(&bucket.owner),
        // Orphaned rows are admin-cleanable.
        None => auth.is_admin(),
    };
    if !manages {
        return Err(ApiError::forbidden("you do not manage this bucket"));
    }

    state.metadata.delete_short_url(&code).await?;
    state.cache.invalidate(&crate::cache::short_url_key(&code));
    Ok(StatusCode::NO_CONTENT.into_response())
}
