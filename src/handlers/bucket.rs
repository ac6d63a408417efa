//! Bucket handlers: create, list, detail, update, delete, summary, ZIP.

use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

use super::{require_bucket, FileView, Pagination, BUCKET_DETAIL_FILE_LIMIT};
use crate::auth::AuthContext;
use crate::errors::ApiError;
use crate::hub::Event;
use crate::ids;
use crate::metadata::store::{
    BucketListQuery, BucketPatch, BucketRecord, BucketSort, FileListQuery, FileSort, SortOrder,
};
use crate::AppState;

/// How many times bucket-ID generation retries on collision.
const ID_RETRIES: usize = 10;

// -- Create -------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateBucketRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub expires_in: Option<String>,
}

/// `POST /api/buckets` -- create a bucket.
pub async fn create_bucket(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<CreateBucketRequest>,
) -> Result<Response, ApiError> {
    if auth.is_public() {
        return Err(ApiError::forbidden("a credential is required to create buckets"));
    }

    let name = body.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::validation("bucket name must not be blank"));
    }
    if name.chars().count() > 255 {
        return Err(ApiError::validation("bucket name exceeds 255 characters"));
    }
    if let Some(description) = &body.description {
        if description.chars().count() > 1000 {
            return Err(ApiError::validation("description exceeds 1000 characters"));
        }
    }

    let expires_at = ids::parse_expiry(body.expires_in.as_deref(), ids::ExpiryKind::Bucket)
        .map_err(ApiError::validation)?;

    let mut id = ids::generate_bucket_id();
    let mut retries = ID_RETRIES;
    while state.metadata.bucket_id_exists(&id).await? {
        retries -= 1;
        if retries == 0 {
            return Err(ApiError::Conflict {
                message: "could not allocate a unique bucket id".to_string(),
            });
        }
        id = ids::generate_bucket_id();
    }

    let record = BucketRecord {
        id,
        name,
        description: body.description,
        owner: auth.owner_name().to_string(),
        owner_key_prefix: auth.key_prefix().map(str::to_string),
        created_at: crate::metadata::store::now(),
        expires_at,
        last_used_at: None,
        file_count: 0,
        total_size: 0,
        download_count: 0,
    };
    state.metadata.create_bucket(record.clone()).await?;
    state.cache.invalidate_stats();
    state.hub.publish(&Event::BucketCreated {
        bucket: record.clone(),
    });
    info!(bucket = %record.id, owner = %record.owner, "bucket created");

    Ok((StatusCode::CREATED, Json(record)).into_response())
}

// -- List ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ListBucketsParams {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub order: Option<String>,
    #[serde(default)]
    pub include_expired: Option<bool>,
}

#[derive(Debug, Serialize)]
struct BucketListResponse {
    buckets: Vec<BucketRecord>,
    total: i64,
    limit: i64,
    offset: i64,
}

/// `GET /api/buckets` -- list buckets visible to the caller.
pub async fn list_buckets(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Query(params): Query<ListBucketsParams>,
) -> Result<Response, ApiError> {
    let owner = match &auth {
        AuthContext::Admin => None,
        AuthContext::Owner { name, .. } => Some(name.clone()),
        AuthContext::Public => {
            return Err(ApiError::forbidden("a credential is required to list buckets"))
        }
    };

    let sort = match params.sort.as_deref() {
        None => BucketSort::default(),
        Some(s) => BucketSort::parse(s)
            .ok_or_else(|| ApiError::validation(format!("unknown sort key: {s}")))?,
    };
    let order = match params.order.as_deref() {
        None => SortOrder::default(),
        Some(o) => SortOrder::parse(o)
            .ok_or_else(|| ApiError::validation(format!("unknown sort order: {o}")))?,
    };
    let page = Pagination {
        limit: params.limit.unwrap_or(50),
        offset: params.offset.unwrap_or(0),
    };
    let (limit, offset) = page.clamped();

    let include_expired = auth.is_admin() && params.include_expired.unwrap_or(false);

    let (buckets, total) = state
        .metadata
        .list_buckets(BucketListQuery {
            owner,
            include_expired,
            sort,
            order,
            limit,
            offset,
        })
        .await?;

    Ok(Json(BucketListResponse {
        buckets,
        total,
        limit,
        offset,
    })
    .into_response())
}

// -- Detail -------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct BucketDetail {
    #[serde(flatten)]
    bucket: BucketRecord,
    files: Vec<FileView>,
    has_more_files: bool,
}

/// Build (and cache) the detail view: the bucket plus its first 100 files.
async fn load_bucket_detail(
    state: &AppState,
    id: &str,
) -> Result<serde_json::Value, ApiError> {
    if let Some(detail) = state.cache.get_bucket_detail(id) {
        // A cached detail may outlive the bucket's expiry; re-check.
        let expired = detail
            .get("expires_at")
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|at| at <= Utc::now())
            .unwrap_or(false);
        if !expired {
            return Ok(detail);
        }
        return Err(ApiError::not_found("bucket"));
    }

    let bucket = require_bucket(state, id, false).await?;
    let (files, total) = state
        .metadata
        .list_files(
            id,
            FileListQuery {
                sort: FileSort::Path,
                order: SortOrder::Asc,
                limit: BUCKET_DETAIL_FILE_LIMIT,
                offset: 0,
            },
        )
        .await?;

    let detail = BucketDetail {
        bucket,
        has_more_files: total > BUCKET_DETAIL_FILE_LIMIT,
        files: files.into_iter().map(FileView::from).collect(),
    };
    let value = serde_json::to_value(detail).map_err(anyhow::Error::from)?;
    state.cache.put_bucket_detail(id, value.clone());
    Ok(value)
}

/// `GET /api/buckets/{id}` -- bucket detail with its first 100 files.
pub async fn get_bucket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let detail = load_bucket_detail(&state, &id).await?;
    Ok(Json(detail).into_response())
}

// -- Update -------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct UpdateBucketRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub expires_in: Option<String>,
}

/// `PATCH /api/buckets/{id}` -- update name, description, or expiry.
pub async fn update_bucket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<UpdateBucketRequest>,
) -> Result<Response, ApiError> {
    if body.name.is_none() && body.description.is_none() && body.expires_in.is_none() {
        return Err(ApiError::validation(
            "at least one of name, description, expires_in is required",
        ));
    }

    let bucket = require_bucket(&state, &id, auth.is_admin()).await?;
    if !auth.can_manage(&bucket.owner) {
        return Err(ApiError::forbidden("you do not manage this bucket"));
    }

    let mut patch = BucketPatch::default();
    let mut changes = serde_json::Map::new();

    if let Some(name) = body.name {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(ApiError::validation("bucket name must not be blank"));
        }
        if name.chars().count() > 255 {
            return Err(ApiError::validation("bucket name exceeds 255 characters"));
        }
        changes.insert("name".to_string(), serde_json::Value::String(name.clone()));
        patch.name = Some(name);
    }
    if let Some(description) = body.description {
        if description.chars().count() > 1000 {
            return Err(ApiError::validation("description exceeds 1000 characters"));
        }
        changes.insert(
            "description".to_string(),
            serde_json::Value::String(description.clone()),
        );
        patch.description = Some(description);
    }
    if let Some(expires_in) = body.expires_in {
        let expires_at = ids::parse_expiry(Some(&expires_in), ids::ExpiryKind::Bucket)
            .map_err(ApiError::validation)?;
        changes.insert(
            "expires_at".to_string(),
            match expires_at {
                Some(at) => serde_json::Value::String(at.to_rfc3339()),
                None => serde_json::Value::Null,
            },
        );
        patch.expires_at = Some(expires_at);
    }

    if !state.metadata.update_bucket(&id, patch).await? {
        return Err(ApiError::not_found("bucket"));
    }

    state.cache.invalidate(&crate::cache::bucket_key(&id));
    state.cache.invalidate_stats();
    state.hub.publish(&Event::BucketUpdated {
        bucket_id: id.clone(),
        changes: serde_json::Value::Object(changes),
    });

    let updated = require_bucket(&state, &id, true).await?;
    Ok(Json(updated).into_response())
}

// -- Delete -------------------------------------------------------------------

/// Remove a bucket's dependents, its row, its blob tree, and its cache
/// entries, then announce the deletion.  Shared with the sweeper.
pub async fn delete_bucket_contents(
    state: &AppState,
    bucket: &BucketRecord,
) -> anyhow::Result<()> {
    state.metadata.delete_files_for_bucket(&bucket.id).await?;
    state.metadata.delete_short_urls_for_bucket(&bucket.id).await?;
    state
        .metadata
        .delete_upload_tokens_for_bucket(&bucket.id)
        .await?;
    state.metadata.delete_bucket(&bucket.id).await?;

    if let Err(e) = state.blobs.delete_bucket_tree(&bucket.id).await {
        warn!(bucket = %bucket.id, error = %e, "failed to remove blob tree");
    }

    state.cache.invalidate_bucket(&bucket.id);
    state.cache.invalidate_stats();
    state.hub.publish(&Event::BucketDeleted {
        bucket_id: bucket.id.clone(),
    });
    info!(bucket = %bucket.id, "bucket deleted");
    Ok(())
}

/// `DELETE /api/buckets/{id}` -- cascading delete.
pub async fn delete_bucket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Response, ApiError> {
    let bucket = require_bucket(&state, &id, auth.is_admin()).await?;
    if !auth.can_manage(&bucket.owner) {
        return Err(ApiError::forbidden("you do not manage this bucket"));
    }

    delete_bucket_contents(&state, &bucket).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// -- Summary ------------------------------------------------------------------

/// `GET /api/buckets/{id}/summary` -- plain-text report.
pub async fn bucket_summary(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let bucket = require_bucket(&state, &id, false).await?;
    let files = state.metadata.files_for_bucket(&id).await?;

    let mut report = String::new();
    report.push_str(&format!("Bucket: {} ({})\n", bucket.name, bucket.id));
    report.push_str(&format!("Owner: {}\n", bucket.owner));
    report.push_str(&format!(
        "Files: {} ({})\n",
        bucket.file_count,
        super::human_size(bucket.total_size)
    ));
    report.push_str(&format!("Created: {}\n", bucket.created_at.to_rfc3339()));
    report.push_str(&format!(
        "Expires: {}\n",
        bucket
            .expires_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    ));
    if !files.is_empty() {
        report.push('\n');
        for file in &files {
            report.push_str(&format!(
                "  {} ({})\n",
                file.path,
                super::human_size(file.size)
            ));
        }
    }

    Ok(([("content-type", "text/plain; charset=utf-8")], report).into_response())
}

// -- ZIP ----------------------------------------------------------------------

fn zip_headers(response: &mut Response, bucket: &BucketRecord) {
    let headers = response.headers_mut();
    headers.insert("content-type", HeaderValue::from_static("application/zip"));
    let disposition = format!(
        "attachment; filename=\"{}.zip\"",
        bucket.name.replace(['"', '\\'], "_")
    );
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert("content-disposition", value);
    }
}

/// `GET /api/buckets/{id}/zip` -- stream an archive of every file.
///
/// The archive is assembled into an anonymous temp file (the zip writer
/// needs `Seek`) and then streamed out; the entry loop awaits between
/// entries, so a client disconnect cancels the assembly.
pub async fn zip_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let bucket = require_bucket(&state, &id, false).await?;
    let files = state.metadata.files_for_bucket(&id).await?;

    let tmp = tempfile::tempfile().map_err(anyhow::Error::from)?;
    let mut writer = zip::ZipWriter::new(tmp);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);

    let mut buf = vec![0u8; 64 * 1024];
    for file in &files {
        let Some((mut blob, _len)) = state.blobs.open_read(&id, &file.path).await? else {
            warn!(bucket = %id, path = %file.path, "blob missing during zip, skipping");
            continue;
        };
        writer
            .start_file(file.path.as_str(), options)
            .map_err(anyhow::Error::from)?;
        loop {
            let n = blob.read(&mut buf).await.map_err(anyhow::Error::from)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).map_err(anyhow::Error::from)?;
        }
    }

    let mut archive = writer.finish().map_err(anyhow::Error::from)?;
    archive
        .seek(SeekFrom::Start(0))
        .map_err(anyhow::Error::from)?;

    let stream = ReaderStream::new(tokio::fs::File::from_std(archive));
    let mut response = Body::from_stream(stream).into_response();
    zip_headers(&mut response, &bucket);
    Ok(response)
}

/// `HEAD /api/buckets/{id}/zip` -- archive headers, no body.
pub async fn zip_head(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let bucket = require_bucket(&state, &id, false).await?;
    let mut response = StatusCode::OK.into_response();
    zip_headers(&mut response, &bucket);
    Ok(response)
}
