//! Upload handlers: multipart, single-file stream, and PATCH content.
//!
//! Both write entry-points share one body-to-blob pipeline: stream the
//! part to disk atomically, then reconcile metadata.  Re-uploading an
//! existing `(bucket, path)` overwrites the blob, updates size and
//! `updated_at`, and preserves the short code; a new path gets a fresh
//! short code and file row.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use metrics::counter;
use serde::Deserialize;
use tracing::{info, warn};

use super::token::validate_token_cached;
use super::{normalize_path, require_bucket, FileView};
use crate::auth::AuthContext;
use crate::errors::ApiError;
use crate::hub::Event;
use crate::ids;
use crate::metadata::store::{BucketRecord, FileRecord, ShortUrlRecord};
use crate::metrics::UPLOADS_TOTAL;
use crate::storage::fs::{PatchOutcome, PayloadTooLarge};
use crate::AppState;

/// Multipart field names whose parts are files; the part's filename
/// becomes the logical path. Any other field name is itself the path.
const FILE_FIELD_NAMES: &[&str] = &["file", "files", "upload", "uploads", "blob"];

/// How many times short-code generation retries on collision.
const SHORT_CODE_RETRIES: usize = 8;

fn is_file_field(name: &str) -> bool {
    FILE_FIELD_NAMES.iter().any(|f| f.eq_ignore_ascii_case(name))
}

// -- Size limiting ------------------------------------------------------------

/// Reject early when the declared Content-Length already exceeds the cap.
fn check_content_length(headers: &HeaderMap, max: u64) -> Result<(), ApiError> {
    if max == 0 {
        return Ok(());
    }
    let declared = headers
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if matches!(declared, Some(len) if len > max) {
        return Err(ApiError::PayloadTooLarge);
    }
    Ok(())
}

/// Wrap a body stream so the running total (shared across all parts of
/// one request) aborts the write once it passes `max`.
fn limit_stream<S, E>(
    stream: S,
    used: Arc<AtomicU64>,
    max: u64,
) -> impl Stream<Item = anyhow::Result<Bytes>>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<anyhow::Error>,
{
    stream.map(move |chunk| {
        let chunk = chunk.map_err(Into::into)?;
        if max > 0 {
            let total = used.fetch_add(chunk.len() as u64, Ordering::Relaxed) + chunk.len() as u64;
            if total > max {
                return Err(PayloadTooLarge.into());
            }
        }
        Ok(chunk)
    })
}

/// Translate blob-write failures, surfacing the size cap as a 413.
fn map_store_error(e: anyhow::Error) -> ApiError {
    if e.downcast_ref::<PayloadTooLarge>().is_some() {
        ApiError::PayloadTooLarge
    } else {
        ApiError::Internal(e)
    }
}

// -- Authorization ------------------------------------------------------------

/// Admin, the bucket's owner, or a valid upload token for this bucket.
/// Returns the token when that is what authorized the write.
async fn authorize_upload(
    state: &AppState,
    auth: &AuthContext,
    bucket: &BucketRecord,
    token: Option<&str>,
) -> Result<Option<String>, ApiError> {
    if auth.can_manage(&bucket.owner) {
        return Ok(None);
    }
    let Some(token) = token else {
        return Err(ApiError::forbidden(
            "uploading requires bucket ownership or an upload token",
        ));
    };
    let validity = validate_token_cached(state, token).await?;
    if !validity.is_valid || validity.bucket_id != bucket.id {
        return Err(ApiError::forbidden("upload token is invalid for this bucket"));
    }
    Ok(Some(token.to_string()))
}

/// Count one committed file against the upload token.
async fn consume_token(state: &AppState, token: &str) {
    if let Err(e) = state.metadata.increment_token_usage(token, 1).await {
        warn!(error = %e, "failed to consume upload token slot");
    }
    state.cache.invalidate(&crate::cache::upload_token_key(token));
}

// -- Commit -------------------------------------------------------------------

/// Reconcile metadata after a blob landed on disk.
///
/// Overwrites keep the short code and bump size and `updated_at`; new
/// paths allocate a short code (retrying on collision), insert the file
/// row, and bump the bucket aggregates.
async fn commit_file(
    state: &AppState,
    bucket_id: &str,
    path: &str,
    size: i64,
) -> Result<(FileRecord, bool), ApiError> {
    let now = crate::metadata::store::now();

    if let Some(existing) = state.metadata.get_file(bucket_id, path).await? {
        state
            .metadata
            .update_file_size(bucket_id, path, size, now)
            .await?;
        let record = FileRecord {
            size,
            updated_at: now,
            ..existing
        };
        invalidate_after_write(state, bucket_id, path);
        state.hub.publish(&Event::FileUpdated {
            bucket_id: bucket_id.to_string(),
            file: record.clone(),
        });
        return Ok((record, false));
    }

    let mut short_code = None;
    for _ in 0..SHORT_CODE_RETRIES {
        let candidate = ids::generate_short_code();
        let inserted = state
            .metadata
            .insert_short_url(ShortUrlRecord {
                code: candidate.clone(),
                bucket_id: bucket_id.to_string(),
                file_path: path.to_string(),
                created_at: now,
            })
            .await?;
        if inserted {
            short_code = Some(candidate);
            break;
        }
    }
    let Some(short_code) = short_code else {
        return Err(ApiError::Conflict {
            message: "could not allocate a unique short code".to_string(),
        });
    };

    let name = path.rsplit('/').next().unwrap_or(path).to_string();
    let record = FileRecord {
        bucket_id: bucket_id.to_string(),
        path: path.to_string(),
        name,
        size,
        mime_type: ids::mime_type_for(path).to_string(),
        short_code: Some(short_code),
        created_at: now,
        updated_at: now,
    };
    state.metadata.insert_file(record.clone()).await?;
    state.metadata.apply_file_delta(bucket_id, 1, size).await?;

    invalidate_after_write(state, bucket_id, path);
    state.hub.publish(&Event::FileCreated {
        bucket_id: bucket_id.to_string(),
        file: record.clone(),
    });
    Ok((record, true))
}

fn invalidate_after_write(state: &AppState, bucket_id: &str, path: &str) {
    state.cache.invalidate(&crate::cache::file_key(bucket_id, path));
    state.cache.invalidate(&crate::cache::bucket_key(bucket_id));
    state.cache.invalidate_stats();
}

/// Write one body to the blob store and reconcile metadata, removing the
/// blob again when reconciliation of a fresh file fails.
async fn store_and_commit<S>(
    state: &AppState,
    bucket_id: &str,
    path: &str,
    body: S,
) -> Result<FileRecord, ApiError>
where
    S: Stream<Item = anyhow::Result<Bytes>> + Unpin,
{
    let existed = state.metadata.get_file(bucket_id, path).await?.is_some();
    let size = state
        .blobs
        .store_atomic(bucket_id, path, body)
        .await
        .map_err(map_store_error)?;

    match commit_file(state, bucket_id, path, size as i64).await {
        Ok((record, _created)) => {
            counter!(UPLOADS_TOTAL).increment(1);
            Ok(record)
        }
        Err(e) => {
            // A fresh blob without a row violates the row↔blob invariant;
            // roll the write back.
            if !existed {
                if let Err(cleanup) = state.blobs.delete_blob(bucket_id, path).await {
                    warn!(bucket = %bucket_id, path = %path, error = %cleanup,
                        "failed to remove blob after metadata failure");
                } else {
                    info!(bucket = %bucket_id, path = %path,
                        "removed blob after metadata failure");
                }
                state.metadata.delete_short_url_for_path(bucket_id, path).await.ok();
            }
            Err(e)
        }
    }
}

// -- Multipart ----------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    #[serde(default)]
    pub token: Option<String>,
}

/// `POST /api/buckets/{id}/upload` -- multipart upload, one file per part.
pub async fn multipart_upload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<UploadParams>,
    Extension(auth): Extension<AuthContext>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let bucket = require_bucket(&state, &id, false).await?;
    let token = authorize_upload(&state, &auth, &bucket, params.token.as_deref()).await?;

    let max = state.config.server.max_upload_size;
    check_content_length(&headers, max)?;
    let used = Arc::new(AtomicU64::new(0));

    let mut uploaded: Vec<FileView> = Vec::new();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                return Err(ApiError::validation(format!("malformed multipart body: {e}")))
            }
        };

        let field_name = field.name().unwrap_or_default().to_string();
        let raw_path = if is_file_field(&field_name) {
            field
                .file_name()
                .map(str::to_string)
                .ok_or_else(|| ApiError::validation("file part is missing a filename"))?
        } else if !field_name.is_empty() {
            field_name
        } else {
            return Err(ApiError::validation("multipart part is missing a name"));
        };
        let path = normalize_path(&raw_path)?;

        let body = Box::pin(limit_stream(field, used.clone(), max));
        let record = store_and_commit(&state, &id, &path, body).await?;

        if let Some(token) = &token {
            consume_token(&state, token).await;
        }
        uploaded.push(FileView::from(record));
    }

    if uploaded.is_empty() {
        return Err(ApiError::validation("multipart body contained no parts"));
    }

    info!(bucket = %id, files = uploaded.len(), "multipart upload committed");
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "uploaded": uploaded })),
    )
        .into_response())
}

// -- Stream -------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StreamUploadParams {
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

/// `PUT /api/buckets/{id}/upload/stream?filename=...` -- the request body
/// is the blob.
pub async fn stream_upload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<StreamUploadParams>,
    Extension(auth): Extension<AuthContext>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let Some(filename) = params.filename.as_deref().filter(|f| !f.is_empty()) else {
        return Err(ApiError::validation("the filename query parameter is required"));
    };

    let bucket = require_bucket(&state, &id, false).await?;
    let token = authorize_upload(&state, &auth, &bucket, params.token.as_deref()).await?;

    let max = state.config.server.max_upload_size;
    check_content_length(&headers, max)?;
    let used = Arc::new(AtomicU64::new(0));

    let path = normalize_path(filename)?;
    let stream = Box::pin(limit_stream(body.into_data_stream(), used, max));
    let record = store_and_commit(&state, &id, &path, stream).await?;

    if let Some(token) = &token {
        consume_token(&state, token).await;
    }

    info!(bucket = %id, path = %path, size = record.size, "stream upload committed");
    Ok((StatusCode::CREATED, Json(FileView::from(record))).into_response())
}

// -- PATCH content ------------------------------------------------------------

/// Parsed `Content-Range: bytes {start}-{end}/*` header.
fn parse_content_range(value: &str) -> Option<(u64, u64)> {
    let spec = value.trim().strip_prefix("bytes ")?;
    let (range, _total) = spec.split_once('/')?;
    let (start_s, end_s) = range.split_once('-')?;
    let start: u64 = start_s.trim().parse().ok()?;
    let end: u64 = end_s.trim().parse().ok()?;
    if end < start {
        return None;
    }
    Some((start, end))
}

/// `PATCH /api/buckets/{id}/files/{*path}/content` -- partial write.
///
/// `Content-Range: bytes {start}-{end}/*` overwrites in place;
/// `X-Append: true` appends to the current end.  Only existing files.
pub async fn patch_content(
    State(state): State<Arc<AppState>>,
    Path((id, raw_path)): Path<(String, String)>,
    Query(params): Query<UploadParams>,
    Extension(auth): Extension<AuthContext>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let Some(content_path) = raw_path.strip_suffix("/content") else {
        return Err(ApiError::not_found("file"));
    };

    let bucket = require_bucket(&state, &id, false).await?;
    authorize_upload(&state, &auth, &bucket, params.token.as_deref()).await?;
    let path = normalize_path(content_path)?;

    let append = headers
        .get("x-append")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let offset = if append {
        0
    } else {
        let header = headers
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                ApiError::validation("PATCH requires Content-Range or X-Append: true")
            })?;
        let (start, _end) = parse_content_range(header).ok_or_else(|| {
            ApiError::validation("Content-Range must have the form: bytes {start}-{end}/*")
        })?;
        start
    };

    let existing = state
        .metadata
        .get_file(&id, &path)
        .await?
        .ok_or_else(|| ApiError::not_found("file"))?;

    let max = state.config.server.max_upload_size;
    check_content_length(&headers, max)?;
    let used = Arc::new(AtomicU64::new(0));
    let stream = Box::pin(limit_stream(body.into_data_stream(), used, max));

    let outcome = state
        .blobs
        .patch_file(&id, &path, stream, offset, append)
        .await
        .map_err(map_store_error)?;

    let new_size = match outcome {
        PatchOutcome::Missing => return Err(ApiError::not_found("file")),
        PatchOutcome::Unsatisfiable { size } => {
            return Err(ApiError::RangeNotSatisfiable { total: Some(size) })
        }
        PatchOutcome::Written { new_size } => new_size as i64,
    };

    let now = crate::metadata::store::now();
    state
        .metadata
        .update_file_size(&id, &path, new_size, now)
        .await?;
    let record = FileRecord {
        size: new_size,
        updated_at: now,
        ..existing
    };

    invalidate_after_write(&state, &id, &path);
    state.hub.publish(&Event::FileUpdated {
        bucket_id: id.clone(),
        file: record.clone(),
    });

    Ok(Json(FileView::from(record)).into_response())
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_field_names() {
        assert!(is_file_field("file"));
        assert!(is_file_field("FILES"));
        assert!(is_file_field("Blob"));
        assert!(!is_file_field("notes/today.txt"));
        assert!(!is_file_field(""));
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range("bytes 7-11/*"), Some((7, 11)));
        assert_eq!(parse_content_range("bytes 0-0/*"), Some((0, 0)));
        assert_eq!(parse_content_range("bytes 7-11/100"), Some((7, 11)));
        assert_eq!(parse_content_range("bytes 11-7/*"), None);
        assert_eq!(parse_content_range("bytes 7-11"), None);
        assert_eq!(parse_content_range("7-11/*"), None);
    }

    #[tokio::test]
    async fn test_limit_stream_aborts_past_cap() {
        use futures::stream;

        let chunks: Vec<Result<Bytes, std::convert::Infallible>> = vec![
            Ok(Bytes::from(vec![0u8; 600])),
            Ok(Bytes::from(vec![0u8; 600])),
        ];
        let used = Arc::new(AtomicU64::new(0));
        let mut limited = Box::pin(limit_stream(stream::iter(chunks), used, 1000));

        assert!(limited.next().await.unwrap().is_ok());
        let second = limited.next().await.unwrap();
        assert!(second.is_err());
        assert!(second
            .unwrap_err()
            .downcast_ref::<PayloadTooLarge>()
            .is_some());
    }

    #[tokio::test]
    async fn test_limit_stream_unlimited_when_zero() {
        use futures::stream;

        let chunks: Vec<Result<Bytes, std::convert::Infallible>> =
            vec![Ok(Bytes::from(vec![0u8; 10_000]))];
        let used = Arc::new(AtomicU64::new(0));
        let mut limited = Box::pin(limit_stream(stream::iter(chunks), used, 0));
        assert!(limited.next().await.unwrap().is_ok());
    }
}
