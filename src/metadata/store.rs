//! Metadata store trait and record types.
//!
//! Buckets, files, API keys, short URLs, and upload tokens are persisted
//! through the [`MetadataStore`] trait.  Cascades (bucket → files, short
//! urls, tokens, blobs) are enforced by the callers, not by SQL foreign
//! keys, so blob cleanup and cache invalidation stay aligned with row
//! deletion.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// The current instant truncated to the store's millisecond resolution,
/// so a record read back from the store equals the one that was written.
pub fn now() -> DateTime<Utc> {
    let now = Utc::now();
    let sub_millis = i64::from(now.timestamp_subsec_nanos() % 1_000_000);
    now - chrono::Duration::nanoseconds(sub_millis)
}

/// A bucket: a named, optionally time-bounded namespace for files.
#[derive(Debug, Clone, Serialize)]
pub struct BucketRecord {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub owner: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_key_prefix: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    pub file_count: i64,
    pub total_size: i64,
    pub download_count: i64,
}

impl BucketRecord {
    /// Whether the bucket has passed its expiry instant.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// One stored file. Composite key `(bucket_id, path)`; `path` is the
/// lowercased URL-decoded logical path and `name` its final segment.
#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    pub bucket_id: String,
    pub path: String,
    pub name: String,
    pub size: i64,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Reverse index row for a short code.
#[derive(Debug, Clone)]
pub struct ShortUrlRecord {
    pub code: String,
    pub bucket_id: String,
    pub file_path: String,
    pub created_at: DateTime<Utc>,
}

/// A long-lived API credential. Only the prefix and the SHA-256 digest of
/// the secret portion are stored.
#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyRecord {
    pub prefix: String,
    #[serde(skip)]
    pub hashed_secret: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

/// A scoped single-bucket write grant.
#[derive(Debug, Clone, Serialize)]
pub struct UploadTokenRecord {
    pub token: String,
    pub bucket_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_uploads: Option<i64>,
    pub uploads_used: i64,
}

impl UploadTokenRecord {
    /// Whether the token can still authorize an upload.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        if self.expires_at <= now {
            return false;
        }
        match self.max_uploads {
            Some(max) => self.uploads_used < max,
            None => true,
        }
    }
}

// -- Query types --------------------------------------------------------------

/// Sort order shared by list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "asc" => Some(SortOrder::Asc),
            "desc" => Some(SortOrder::Desc),
            _ => None,
        }
    }

    pub fn sql(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Bucket list sort keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BucketSort {
    Name,
    #[default]
    CreatedAt,
    ExpiresAt,
    LastUsedAt,
    TotalSize,
}

impl BucketSort {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "name" => Some(BucketSort::Name),
            "created_at" => Some(BucketSort::CreatedAt),
            "expires_at" => Some(BucketSort::ExpiresAt),
            "last_used_at" => Some(BucketSort::LastUsedAt),
            "total_size" => Some(BucketSort::TotalSize),
            _ => None,
        }
    }

    pub fn sql(self) -> &'static str {
        match self {
            BucketSort::Name => "name",
            BucketSort::CreatedAt => "created_at",
            BucketSort::ExpiresAt => "expires_at",
            BucketSort::LastUsedAt => "last_used_at",
            BucketSort::TotalSize => "total_size",
        }
    }
}

/// File list sort keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSort {
    Name,
    Path,
    Size,
    CreatedAt,
    UpdatedAt,
    MimeType,
}

impl Default for FileSort {
    fn default() -> Self {
        FileSort::Path
    }
}

impl FileSort {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "name" => Some(FileSort::Name),
            "path" => Some(FileSort::Path),
            "size" => Some(FileSort::Size),
            "created_at" => Some(FileSort::CreatedAt),
            "updated_at" => Some(FileSort::UpdatedAt),
            "mime_type" => Some(FileSort::MimeType),
            _ => None,
        }
    }

    pub fn sql(self) -> &'static str {
        match self {
            FileSort::Name => "name",
            FileSort::Path => "path",
            FileSort::Size => "size",
            FileSort::CreatedAt => "created_at",
            FileSort::UpdatedAt => "updated_at",
            FileSort::MimeType => "mime_type",
        }
    }
}

/// Filter, sort, and page parameters for bucket listing.
#[derive(Debug, Clone, Default)]
pub struct BucketListQuery {
    /// Restrict to buckets with this owner name (`None` = all).
    pub owner: Option<String>,
    /// Include rows whose `expires_at` has passed.
    pub include_expired: bool,
    pub sort: BucketSort,
    pub order: SortOrder,
    pub limit: i64,
    pub offset: i64,
}

/// Sort and page parameters for file listing.
#[derive(Debug, Clone)]
pub struct FileListQuery {
    pub sort: FileSort,
    pub order: SortOrder,
    pub limit: i64,
    pub offset: i64,
}

/// Field updates for a bucket PATCH. `expires_at` uses two levels of
/// `Option`: outer absent = leave unchanged, inner `None` = clear expiry.
#[derive(Debug, Clone, Default)]
pub struct BucketPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub expires_at: Option<Option<DateTime<Utc>>>,
}

/// System-wide totals for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StatsTotals {
    pub total_buckets: i64,
    pub total_files: i64,
    pub total_size: i64,
    pub total_keys: i64,
    pub total_downloads: i64,
}

/// Per-owner storage aggregate (expired buckets excluded).
#[derive(Debug, Clone, Serialize)]
pub struct OwnerUsage {
    pub owner: String,
    pub bucket_count: i64,
    pub total_size: i64,
}

/// Aggregate usage of the buckets created by one API key.
#[derive(Debug, Clone, Serialize)]
pub struct KeyUsage {
    pub bucket_count: i64,
    pub file_count: i64,
    pub total_size: i64,
    pub download_count: i64,
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// Persistent store for all CarbonFiles metadata.
pub trait MetadataStore: Send + Sync {
    // -- Health --------------------------------------------------------------

    /// Cheap reachability probe for `/healthz`.
    fn ping(&self) -> BoxFuture<'_, ()>;

    // -- Buckets -------------------------------------------------------------

    fn create_bucket(&self, record: BucketRecord) -> BoxFuture<'_, ()>;

    fn get_bucket(&self, id: &str) -> BoxFuture<'_, Option<BucketRecord>>;

    fn bucket_id_exists(&self, id: &str) -> BoxFuture<'_, bool>;

    /// List buckets with filtering, sorting, and paging. Returns the page
    /// and the total row count before paging.
    fn list_buckets(&self, query: BucketListQuery)
        -> BoxFuture<'_, (Vec<BucketRecord>, i64)>;

    /// Apply a partial update. Returns false when the bucket is missing.
    fn update_bucket(&self, id: &str, patch: BucketPatch) -> BoxFuture<'_, bool>;

    fn delete_bucket(&self, id: &str) -> BoxFuture<'_, ()>;

    /// Adjust the aggregate counters by the given deltas.
    fn apply_file_delta(
        &self,
        id: &str,
        file_delta: i64,
        size_delta: i64,
    ) -> BoxFuture<'_, ()>;

    /// Stamp `last_used_at` to now.
    fn touch_bucket_last_used(&self, id: &str) -> BoxFuture<'_, ()>;

    fn increment_download_count(&self, id: &str) -> BoxFuture<'_, ()>;

    /// Buckets whose `expires_at` has passed `now`.
    fn list_expired(&self, now: DateTime<Utc>) -> BoxFuture<'_, Vec<BucketRecord>>;

    // -- Files ---------------------------------------------------------------

    fn insert_file(&self, record: FileRecord) -> BoxFuture<'_, ()>;

    fn get_file(&self, bucket_id: &str, path: &str) -> BoxFuture<'_, Option<FileRecord>>;

    /// Update size and `updated_at` for an existing row. Returns the old
    /// size, or `None` when no row exists.
    fn update_file_size(
        &self,
        bucket_id: &str,
        path: &str,
        new_size: i64,
        updated_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Option<i64>>;

    /// Delete a file row, returning it for cascade bookkeeping.
    fn delete_file(&self, bucket_id: &str, path: &str)
        -> BoxFuture<'_, Option<FileRecord>>;

    fn list_files(
        &self,
        bucket_id: &str,
        query: FileListQuery,
    ) -> BoxFuture<'_, (Vec<FileRecord>, i64)>;

    /// All files of a bucket ordered by path (summary, ZIP, cascades).
    fn files_for_bucket(&self, bucket_id: &str) -> BoxFuture<'_, Vec<FileRecord>>;

    fn delete_files_for_bucket(&self, bucket_id: &str) -> BoxFuture<'_, ()>;

    // -- API keys ------------------------------------------------------------

    fn insert_api_key(&self, record: ApiKeyRecord) -> BoxFuture<'_, ()>;

    fn get_api_key(&self, prefix: &str) -> BoxFuture<'_, Option<ApiKeyRecord>>;

    fn list_api_keys(&self) -> BoxFuture<'_, Vec<ApiKeyRecord>>;

    /// Returns false when no such key exists.
    fn delete_api_key(&self, prefix: &str) -> BoxFuture<'_, bool>;

    fn touch_api_key(&self, prefix: &str) -> BoxFuture<'_, ()>;

    /// Aggregates over the buckets this key created.
    fn key_usage(&self, prefix: &str) -> BoxFuture<'_, KeyUsage>;

    // -- Short URLs ----------------------------------------------------------

    /// Insert a short-url row. Returns false when the code is taken.
    fn insert_short_url(&self, record: ShortUrlRecord) -> BoxFuture<'_, bool>;

    fn get_short_url(&self, code: &str) -> BoxFuture<'_, Option<ShortUrlRecord>>;

    /// Returns false when no such code exists.
    fn delete_short_url(&self, code: &str) -> BoxFuture<'_, bool>;

    fn delete_short_url_for_path(&self, bucket_id: &str, path: &str) -> BoxFuture<'_, ()>;

    fn delete_short_urls_for_bucket(&self, bucket_id: &str) -> BoxFuture<'_, ()>;

    // -- Upload tokens -------------------------------------------------------

    fn insert_upload_token(&self, record: UploadTokenRecord) -> BoxFuture<'_, ()>;

    fn get_upload_token(&self, token: &str) -> BoxFuture<'_, Option<UploadTokenRecord>>;

    /// Atomically add `count` to `uploads_used`.
    fn increment_token_usage(&self, token: &str, count: i64) -> BoxFuture<'_, ()>;

    fn delete_upload_tokens_for_bucket(&self, bucket_id: &str) -> BoxFuture<'_, ()>;

    // -- Stats ---------------------------------------------------------------

    fn stats_totals(&self) -> BoxFuture<'_, StatsTotals>;

    fn storage_by_owner(&self, now: DateTime<Utc>) -> BoxFuture<'_, Vec<OwnerUsage>>;
}
