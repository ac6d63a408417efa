//! File handlers: listing, metadata, content download, delete.
//!
//! `GET /api/buckets/{id}/files/{*path}` serves metadata at the bare
//! path and content at the `/content` suffix; range and conditional
//! semantics follow RFC 7232/7233.

use std::sync::Arc;
use std::time::{Duration as StdDuration, SystemTime};

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio_util::io::ReaderStream;
use tracing::warn;

use super::{normalize_path, require_bucket, FileView, Pagination};
use crate::auth::AuthContext;
use crate::errors::ApiError;
use crate::hub::Event;
use crate::metadata::store::{FileListQuery, FileRecord, FileSort, SortOrder};
use crate::metrics::DOWNLOADS_TOTAL;
use crate::AppState;

// -- Range parsing ------------------------------------------------------------

/// Parsed byte range from a Range header.
#[derive(Debug, Clone, PartialEq)]
enum ByteRange {
    /// bytes=start-end (inclusive both ends)
    StartEnd(u64, u64),
    /// bytes=start-  (from start to end of file)
    StartOpen(u64),
    /// bytes=-N  (last N bytes)
    Suffix(u64),
}

/// Parse a Range header value like "bytes=0-4", "bytes=5-", "bytes=-3".
/// Returns None if the header is not a valid single bytes range.
fn parse_range_header(range_str: &str) -> Option<ByteRange> {
    let range_str = range_str.trim();
    let spec = range_str.strip_prefix("bytes=")?;

    // Multi-range lists are not supported.
    if spec.contains(',') {
        return None;
    }

    if let Some(suffix) = spec.strip_prefix('-') {
        let n: u64 = suffix.parse().ok()?;
        if n == 0 {
            return None;
        }
        Some(ByteRange::Suffix(n))
    } else if let Some(stripped) = spec.strip_suffix('-') {
        let start: u64 = stripped.parse().ok()?;
        Some(ByteRange::StartOpen(start))
    } else if let Some((start_s, end_s)) = spec.split_once('-') {
        let start: u64 = start_s.parse().ok()?;
        let end: u64 = end_s.parse().ok()?;
        if start > end {
            return None;
        }
        Some(ByteRange::StartEnd(start, end))
    } else {
        None
    }
}

/// Resolve a ByteRange against a total content length.
/// Returns (start, end) where both are inclusive, or None if unsatisfiable.
fn resolve_range(range: &ByteRange, total: u64) -> Option<(u64, u64)> {
    if total == 0 {
        return None;
    }
    match range {
        ByteRange::StartEnd(start, end) => {
            if *start >= total {
                return None;
            }
            Some((*start, std::cmp::min(*end, total - 1)))
        }
        ByteRange::StartOpen(start) => {
            if *start >= total {
                return None;
            }
            Some((*start, total - 1))
        }
        ByteRange::Suffix(n) => {
            if *n >= total {
                Some((0, total - 1))
            } else {
                Some((total - n, total - 1))
            }
        }
    }
}

// -- Conditional request evaluation -------------------------------------------

/// Strong ETag for a file: `"{size}-{updated_at_millis}"`.
fn etag_for(record: &FileRecord) -> String {
    format!("\"{}-{}\"", record.size, record.updated_at.timestamp_millis())
}

/// Strip surrounding double quotes from an ETag string for comparison.
fn strip_etag_quotes(etag: &str) -> &str {
    let etag = etag.trim();
    if etag.starts_with('"') && etag.ends_with('"') && etag.len() >= 2 {
        &etag[1..etag.len() - 1]
    } else {
        etag
    }
}

fn updated_at_system_time(record: &FileRecord) -> SystemTime {
    let millis = record.updated_at.timestamp_millis().max(0) as u64;
    SystemTime::UNIX_EPOCH + StdDuration::from_millis(millis)
}

/// Whether the request's conditional headers make this a 304.
///
/// `If-None-Match` wins when present; otherwise `If-Modified-Since`
/// compares with one second of tolerance for the header's resolution.
fn is_not_modified(headers: &HeaderMap, record: &FileRecord) -> bool {
    let etag = etag_for(record);

    if let Some(if_none_match) = headers.get("if-none-match").and_then(|v| v.to_str().ok()) {
        let candidate = strip_etag_quotes(if_none_match);
        return candidate == "*" || candidate == strip_etag_quotes(&etag);
    }

    if let Some(if_modified) = headers
        .get("if-modified-since")
        .and_then(|v| v.to_str().ok())
    {
        if let Ok(threshold) = httpdate::parse_http_date(if_modified) {
            return updated_at_system_time(record) <= threshold + StdDuration::from_secs(1);
        }
    }

    false
}

// -- Shared lookup ------------------------------------------------------------

/// Cache-first file metadata lookup. Absence is never cached.
pub async fn get_file_cached(
    state: &AppState,
    bucket_id: &str,
    path: &str,
) -> Result<Option<FileRecord>, ApiError> {
    if let Some(record) = state.cache.get_file(bucket_id, path) {
        return Ok(Some(record));
    }
    let record = state.metadata.get_file(bucket_id, path).await?;
    if let Some(record) = &record {
        state.cache.put_file(record.clone());
    }
    Ok(record)
}

// -- Listing ------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ListFilesParams {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub order: Option<String>,
}

#[derive(Debug, Serialize)]
struct FileListResponse {
    files: Vec<FileView>,
    total: i64,
    limit: i64,
    offset: i64,
}

/// `GET /api/buckets/{id}/files` -- paginated file metadata.
pub async fn list_files(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<ListFilesParams>,
) -> Result<Response, ApiError> {
    require_bucket(&state, &id, false).await?;

    let sort = match params.sort.as_deref() {
        None => FileSort::default(),
        Some(s) => FileSort::parse(s)
            .ok_or_else(|| ApiError::validation(format!("unknown sort key: {s}")))?,
    };
    let order = match params.order.as_deref() {
        None => SortOrder::Asc,
        Some(o) => SortOrder::parse(o)
            .ok_or_else(|| ApiError::validation(format!("unknown sort order: {o}")))?,
    };
    let page = Pagination {
        limit: params.limit.unwrap_or(50),
        offset: params.offset.unwrap_or(0),
    };
    let (limit, offset) = page.clamped();

    let (files, total) = state
        .metadata
        .list_files(
            &id,
            FileListQuery {
                sort,
                order,
                limit,
                offset,
            },
        )
        .await?;

    Ok(Json(FileListResponse {
        files: files.into_iter().map(FileView::from).collect(),
        total,
        limit,
        offset,
    })
    .into_response())
}

// -- Metadata and content dispatch --------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ContentParams {
    #[serde(default)]
    pub download: Option<bool>,
}

/// `GET /api/buckets/{id}/files/{*path}` -- metadata at the bare path,
/// content at the `/content` suffix.
pub async fn get_file_or_content(
    State(state): State<Arc<AppState>>,
    Path((id, raw_path)): Path<(String, String)>,
    Query(params): Query<ContentParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    match raw_path.strip_suffix("/content") {
        Some(content_path) => {
            serve_content(&state, &id, content_path, &params, &headers, true).await
        }
        None => serve_metadata(&state, &id, &raw_path).await,
    }
}

/// `HEAD /api/buckets/{id}/files/{*path}` -- headers only.
pub async fn head_file_or_content(
    State(state): State<Arc<AppState>>,
    Path((id, raw_path)): Path<(String, String)>,
    Query(params): Query<ContentParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    match raw_path.strip_suffix("/content") {
        Some(content_path) => {
            serve_content(&state, &id, content_path, &params, &headers, false).await
        }
        None => {
            // HEAD on metadata: status and headers of the GET, empty body.
            let response = serve_metadata(&state, &id, &raw_path).await?;
            let (parts, _) = response.into_parts();
            Ok(Response::from_parts(parts, Body::empty()))
        }
    }
}

async fn serve_metadata(state: &AppState, id: &str, raw_path: &str) -> Result<Response, ApiError> {
    require_bucket(state, id, false).await?;
    let path = normalize_path(raw_path)?;
    let record = get_file_cached(state, id, &path)
        .await?
        .ok_or_else(|| ApiError::not_found("file"))?;
    Ok(Json(FileView::from(record)).into_response())
}

/// Common download headers for 200/206/304 responses.
fn content_headers(response: &mut Response, record: &FileRecord, download: bool) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&record.mime_type) {
        headers.insert("content-type", value);
    }
    if let Ok(value) = HeaderValue::from_str(&etag_for(record)) {
        headers.insert("etag", value);
    }
    let last_modified = httpdate::fmt_http_date(updated_at_system_time(record));
    if let Ok(value) = HeaderValue::from_str(&last_modified) {
        headers.insert("last-modified", value);
    }
    headers.insert("accept-ranges", HeaderValue::from_static("bytes"));
    headers.insert(
        "cache-control",
        HeaderValue::from_static("public, no-cache"),
    );
    if download {
        let disposition = format!(
            "attachment; filename=\"{}\"",
            record.name.replace(['"', '\\'], "_")
        );
        if let Ok(value) = HeaderValue::from_str(&disposition) {
            headers.insert("content-disposition", value);
        }
    }
}

async fn serve_content(
    state: &AppState,
    id: &str,
    raw_path: &str,
    params: &ContentParams,
    headers: &HeaderMap,
    with_body: bool,
) -> Result<Response, ApiError> {
    require_bucket(state, id, false).await?;
    let path = normalize_path(raw_path)?;
    let record = get_file_cached(state, id, &path)
        .await?
        .ok_or_else(|| ApiError::not_found("file"))?;
    let download = params.download.unwrap_or(false);

    if is_not_modified(headers, &record) {
        let mut response = StatusCode::NOT_MODIFIED.into_response();
        content_headers(&mut response, &record, false);
        response.headers_mut().remove("content-type");
        return Ok(response);
    }

    let Some((mut blob, total)) = state.blobs.open_read(id, &path).await? else {
        warn!(bucket = %id, path = %path, "file row without blob");
        return Err(ApiError::not_found("file"));
    };

    // An If-Range mismatch downgrades a range request to the full body.
    let honor_range = match headers.get("if-range").and_then(|v| v.to_str().ok()) {
        Some(if_range) => strip_etag_quotes(if_range) == strip_etag_quotes(&etag_for(&record)),
        None => true,
    };

    let range = headers
        .get("range")
        .and_then(|v| v.to_str().ok())
        .filter(|_| honor_range)
        .and_then(parse_range_header);

    let (status, start, length, content_range) = match range {
        Some(byte_range) => match resolve_range(&byte_range, total) {
            Some((start, end)) => (
                StatusCode::PARTIAL_CONTENT,
                start,
                end - start + 1,
                Some(format!("bytes {start}-{end}/{total}")),
            ),
            None => {
                return Err(ApiError::RangeNotSatisfiable { total: Some(total) });
            }
        },
        None => (StatusCode::OK, 0, total, None),
    };

    let mut response = if with_body {
        if start > 0 {
            blob.seek(SeekFrom::Start(start))
                .await
                .map_err(anyhow::Error::from)?;
        }
        let stream = ReaderStream::new(blob.take(length));
        let mut response = Body::from_stream(stream).into_response();
        *response.status_mut() = status;
        response
    } else {
        status.into_response()
    };

    content_headers(&mut response, &record, download);
    let headers_out = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&length.to_string()) {
        headers_out.insert("content-length", value);
    }
    if let Some(content_range) = content_range {
        if let Ok(value) = HeaderValue::from_str(&content_range) {
            headers_out.insert("content-range", value);
        }
    }

    if with_body {
        counter!(DOWNLOADS_TOTAL).increment(1);
        spawn_download_stamp(state, id);
    }

    Ok(response)
}

/// Fire-and-forget `last_used_at` stamp and download-count bump.
fn spawn_download_stamp(state: &AppState, bucket_id: &str) {
    let metadata = state.metadata.clone();
    let bucket_id = bucket_id.to_string();
    tokio::spawn(async move {
        if let Err(e) = metadata.touch_bucket_last_used(&bucket_id).await {
            warn!(bucket = %bucket_id, error = %e, "failed to stamp last_used_at");
        }
        if let Err(e) = metadata.increment_download_count(&bucket_id).await {
            warn!(bucket = %bucket_id, error = %e, "failed to bump download count");
        }
    });
}

// -- Delete -------------------------------------------------------------------

/// `DELETE /api/buckets/{id}/files/{*path}` -- remove one file.
pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    Path((id, raw_path)): Path<(String, String)>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Response, ApiError> {
    let bucket = require_bucket(&state, &id, auth.is_admin()).await?;
    if !auth.can_manage(&bucket.owner) {
        return Err(ApiError::forbidden("you do not manage this bucket"));
    }
    let path = normalize_path(&raw_path)?;

    let record = state
        .metadata
        .delete_file(&id, &path)
        .await?
        .ok_or_else(|| ApiError::not_found("file"))?;

    if let Err(e) = state.blobs.delete_blob(&id, &path).await {
        warn!(bucket = %id, path = %path, error = %e, "failed to remove blob");
    }
    state.metadata.delete_short_url_for_path(&id, &path).await?;
    if let Some(code) = &record.short_code {
        state.cache.invalidate(&crate::cache::short_url_key(code));
    }

    state.cache.invalidate(&crate::cache::file_key(&id, &path));
    state.cache.invalidate(&crate::cache::bucket_key(&id));
    state.cache.invalidate_stats();
    state.hub.publish(&Event::FileDeleted {
        bucket_id: id.clone(),
        path: path.clone(),
    });

    Ok(StatusCode::NO_CONTENT.into_response())
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(size: i64) -> FileRecord {
        FileRecord {
            bucket_id: "bkt1".to_string(),
            path: "a.txt".to_string(),
            name: "a.txt".to_string(),
            size,
            mime_type: "text/plain".to_string(),
            short_code: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_parse_range_forms() {
        assert_eq!(parse_range_header("bytes=0-99"), Some(ByteRange::StartEnd(0, 99)));
        assert_eq!(parse_range_header("bytes=100-"), Some(ByteRange::StartOpen(100)));
        assert_eq!(parse_range_header("bytes=-50"), Some(ByteRange::Suffix(50)));
        assert_eq!(parse_range_header("bytes=5-2"), None);
        assert_eq!(parse_range_header("bytes=0-4,6-9"), None);
        assert_eq!(parse_range_header("items=0-4"), None);
        assert_eq!(parse_range_header("bytes=-0"), None);
    }

    #[test]
    fn test_resolve_range() {
        assert_eq!(resolve_range(&ByteRange::StartEnd(0, 99), 1000), Some((0, 99)));
        // End is clamped to the last byte.
        assert_eq!(resolve_range(&ByteRange::StartEnd(990, 2000), 1000), Some((990, 999)));
        assert_eq!(resolve_range(&ByteRange::StartOpen(500), 1000), Some((500, 999)));
        assert_eq!(resolve_range(&ByteRange::Suffix(100), 1000), Some((900, 999)));
        // Suffix larger than the file covers the whole file.
        assert_eq!(resolve_range(&ByteRange::Suffix(5000), 1000), Some((0, 999)));
        // Out of range.
        assert_eq!(resolve_range(&ByteRange::StartEnd(1000, 1001), 1000), None);
        assert_eq!(resolve_range(&ByteRange::StartOpen(1000), 1000), None);
        assert_eq!(resolve_range(&ByteRange::StartEnd(0, 0), 0), None);
    }

    #[test]
    fn test_etag_shape() {
        let r = record(12);
        let etag = etag_for(&r);
        assert!(etag.starts_with(&format!("\"12-{}", r.updated_at.timestamp_millis())));
        assert!(etag.ends_with('"'));
    }

    #[test]
    fn test_if_none_match() {
        let r = record(12);
        let mut headers = HeaderMap::new();
        headers.insert("if-none-match", etag_for(&r).parse().unwrap());
        assert!(is_not_modified(&headers, &r));

        headers.insert("if-none-match", "\"stale-0\"".parse().unwrap());
        assert!(!is_not_modified(&headers, &r));

        headers.insert("if-none-match", "*".parse().unwrap());
        assert!(is_not_modified(&headers, &r));
    }

    #[test]
    fn test_if_modified_since_with_tolerance() {
        let r = record(12);
        let mut headers = HeaderMap::new();

        // A threshold equal to updated_at (header has second resolution)
        // counts as unmodified thanks to the one-second tolerance.
        let at = httpdate::fmt_http_date(updated_at_system_time(&r));
        headers.insert("if-modified-since", at.parse().unwrap());
        assert!(is_not_modified(&headers, &r));

        let old = httpdate::fmt_http_date(SystemTime::UNIX_EPOCH);
        headers.insert("if-modified-since", old.parse().unwrap());
        assert!(!is_not_modified(&headers, &r));
    }
}
