//! HTTP handlers, one module per resource.
//!
//! Each module owns both the domain rules for its resource (ownership
//! checks, aggregate counters, cache invalidation, event emission) and
//! the HTTP translation.  Shared request plumbing lives here.

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};

use crate::errors::ApiError;
use crate::metadata::store::{BucketRecord, FileRecord};
use crate::AppState;

pub mod bucket;
pub mod file;
pub mod key;
pub mod short_url;
pub mod stats;
pub mod token;
pub mod upload;
pub mod ws;

/// Maximum logical path length in characters.
pub const MAX_PATH_LEN: usize = 1024;

/// How many files a bucket detail view embeds.
pub const BUCKET_DETAIL_FILE_LIMIT: i64 = 100;

/// Page parameters shared by list endpoints.
#[derive(Debug, Deserialize)]
pub struct Pagination {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

impl Pagination {
    /// Clamp to sane bounds before hitting the store.
    pub fn clamped(&self) -> (i64, i64) {
        (self.limit.clamp(1, 1000), self.offset.max(0))
    }
}

/// A file as rendered in API responses: the record plus its short link.
#[derive(Debug, Clone, Serialize)]
pub struct FileView {
    pub path: String,
    pub name: String,
    pub size: i64,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_url: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<FileRecord> for FileView {
    fn from(record: FileRecord) -> Self {
        let short_url = record.short_code.as_ref().map(|code| format!("/s/{code}"));
        FileView {
            path: record.path,
            name: record.name,
            size: record.size,
            mime_type: record.mime_type,
            short_code: record.short_code,
            short_url,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// Normalize a raw URL path segment into a logical file path:
/// percent-decoded, lowercased, bounded, with no empty segments.
pub fn normalize_path(raw: &str) -> Result<String, ApiError> {
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|_| ApiError::validation("file path is not valid UTF-8"))?;
    let path = decoded.trim_matches('/').to_lowercase();

    if path.is_empty() {
        return Err(ApiError::validation("file path must not be empty"));
    }
    if path.chars().count() > MAX_PATH_LEN {
        return Err(ApiError::validation("file path exceeds 1024 characters"));
    }
    if path.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..") {
        return Err(ApiError::validation("file path contains invalid segments"));
    }
    Ok(path)
}

/// Look up a bucket and treat expired ones as missing unless the caller
/// explicitly opted in.
pub async fn require_bucket(
    state: &AppState,
    id: &str,
    include_expired: bool,
) -> Result<BucketRecord, ApiError> {
    let bucket = state
        .metadata
        .get_bucket(id)
        .await?
        .ok_or_else(|| ApiError::not_found("bucket"))?;
    if !include_expired && bucket.is_expired(chrono::Utc::now()) {
        return Err(ApiError::not_found("bucket"));
    }
    Ok(bucket)
}

/// Render a byte count for humans (binary units, one decimal).
pub fn human_size(bytes: i64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes.max(0) as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

// -- Tests --------------------------------------------------------------------
