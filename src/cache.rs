//! Process-local metadata cache.
//!
//! Keyed entries with safety-net TTLs; mutating services invalidate
//! eagerly, so the TTL only covers paths that forget.  A per-bucket key
//! index supports bulk invalidation when a bucket changes or dies.
//! Absence is never cached: a missing lookup falls through to the store,
//! so a create is visible immediately.
//!
//! Key shapes and TTLs:
//!
//! | key                          | value                  | TTL    |
//! |------------------------------|------------------------|--------|
//! | `bucket:{id}`                | bucket detail JSON     | 10 min |
//! | `file:{bucket}:{lower path}` | file metadata          | 5 min  |
//! | `short:{code}`               | resolution + expiry    | 10 min |
//! | `uploadtoken:{token}`        | (bucket, validity)     | 2 min  |
//! | `stats`                      | stats JSON             | 5 min  |

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::metadata::store::FileRecord;

pub const BUCKET_TTL: Duration = Duration::from_secs(600);
pub const FILE_TTL: Duration = Duration::from_secs(300);
pub const SHORT_URL_TTL: Duration = Duration::from_secs(600);
pub const UPLOAD_TOKEN_TTL: Duration = Duration::from_secs(120);
pub const STATS_TTL: Duration = Duration::from_secs(300);

pub const STATS_KEY: &str = "stats";

/// Cached short-code resolution. The owning bucket's expiry rides along
/// so a hit can still refuse redirects into an expired bucket.
#[derive(Debug, Clone)]
pub struct ShortResolution {
    pub bucket_id: String,
    pub file_path: String,
    pub bucket_expires_at: Option<DateTime<Utc>>,
}

/// Cached upload-token validity.
#[derive(Debug, Clone)]
pub struct TokenValidity {
    pub bucket_id: String,
    pub is_valid: bool,
}

/// The value side of a cache entry.
#[derive(Debug, Clone)]
pub enum CachedValue {
    BucketDetail(serde_json::Value),
    File(FileRecord),
    ShortUrl(ShortResolution),
    UploadToken(TokenValidity),
    Stats(serde_json::Value),
}

struct Entry {
    value: CachedValue,
    deadline: Instant,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    /// bucket id → keys scoped to that bucket, for bulk invalidation.
    by_bucket: HashMap<String, HashSet<String>>,
}

/// Thread-safe keyed cache with eager and bulk invalidation.
#[derive(Default)]
pub struct Cache {
    inner: Mutex<Inner>,
}

pub fn bucket_key(id: &str) -> String {
    format!("bucket:{id}")
}

pub fn file_key(bucket_id: &str, path: &str) -> String {
    format!("file:{bucket_id}:{}", path.to_lowercase())
}

pub fn short_url_key(code: &str) -> String {
    format!("short:{code}")
}

pub fn upload_token_key(token: &str) -> String {
    format!("uploadtoken:{token}")
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a live entry; expired entries are removed on the way out.
    pub fn get(&self, key: &str) -> Option<CachedValue> {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        match inner.entries.get(key) {
            Some(entry) if entry.deadline > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                inner.entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert an entry. `bucket_scope` registers the key for bulk
    /// invalidation when that bucket changes.
    pub fn put(&self, key: String, value: CachedValue, ttl: Duration, bucket_scope: Option<&str>) {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        if let Some(bucket_id) = bucket_scope {
            inner
                .by_bucket
                .entry(bucket_id.to_string())
                .or_default()
                .insert(key.clone());
        }
        inner.entries.insert(
            key,
            Entry {
                value,
                deadline: Instant::now() + ttl,
            },
        );
    }

    /// Remove one key.
    pub fn invalidate(&self, key: &str) {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        inner.entries.remove(key);
        for keys in inner.by_bucket.values_mut() {
            keys.remove(key);
        }
    }

    /// Remove every tracked key of `bucket_id` that starts with `prefix`.
    pub fn invalidate_for(&self, bucket_id: &str, prefix: &str) {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        let Some(keys) = inner.by_bucket.get(bucket_id) else {
            return;
        };
        let matching: Vec<String> = keys
            .iter()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in &matching {
            inner.entries.remove(key);
        }
        if let Some(keys) = inner.by_bucket.get_mut(bucket_id) {
            for key in &matching {
                keys.remove(key);
            }
            if keys.is_empty() {
                inner.by_bucket.remove(bucket_id);
            }
        }
    }

    /// Remove every tracked key of `bucket_id`.
    pub fn invalidate_bucket(&self, bucket_id: &str) {
        let mut inner = self.inner.lock().expect("mutex poisoned");
        if let Some(keys) = inner.by_bucket.remove(bucket_id) {
            for key in keys {
                inner.entries.remove(&key);
            }
        }
    }

    pub fn invalidate_stats(&self) {
        self.invalidate(STATS_KEY);
    }

    // -- Typed accessors -----------------------------------------------------

    pub fn get_bucket_detail(&self, id: &str) -> Option<serde_json::Value> {
        match self.get(&bucket_key(id)) {
            Some(CachedValue::BucketDetail(v)) => Some(v),
            _ => None,
        }
    }

    pub fn put_bucket_detail(&self, id: &str, detail: serde_json::Value) {
        self.put(
            bucket_key(id),
            CachedValue::BucketDetail(detail),
            BUCKET_TTL,
            Some(id),
        );
    }

    pub fn get_file(&self, bucket_id: &str, path: &str) -> Option<FileRecord> {
        match self.get(&file_key(bucket_id, path)) {
            Some(CachedValue::File(record)) => Some(record),
            _ => None,
        }
    }

    pub fn put_file(&self, record: FileRecord) {
        let key = file_key(&record.bucket_id, &record.path);
        let bucket_id = record.bucket_id.clone();
        self.put(key, CachedValue::File(record), FILE_TTL, Some(&bucket_id));
    }

    pub fn get_short_url(&self, code: &str) -> Option<ShortResolution> {
        match self.get(&short_url_key(code)) {
            Some(CachedValue::ShortUrl(res)) => Some(res),
            _ => None,
        }
    }

    pub fn put_short_url(&self, code: &str, resolution: ShortResolution) {
        let bucket_id = resolution.bucket_id.clone();
        self.put(
            short_url_key(code),
            CachedValue::ShortUrl(resolution),
            SHORT_URL_TTL,
            Some(&bucket_id),
        );
    }

    pub fn get_upload_token(&self, token: &str) -> Option<TokenValidity> {
        match self.get(&upload_token_key(token)) {
            Some(CachedValue::UploadToken(v)) => Some(v),
            _ => None,
        }
    }

    pub fn put_upload_token(&self, token: &str, validity: TokenValidity) {
        let bucket_id = validity.bucket_id.clone();
        self.put(
            upload_token_key(token),
            CachedValue::UploadToken(validity),
            UPLOAD_TOKEN_TTL,
            Some(&bucket_id),
        );
    }

    pub fn get_stats(&self) -> Option<serde_json::Value> {
        match self.get(STATS_KEY) {
            Some(CachedValue::Stats(v)) => Some(v),
            _ => None,
        }
    }

    pub fn put_stats(&self, stats: serde_json::Value) {
        self.put(STATS_KEY.to_string(), CachedValue::Stats(stats), STATS_TTL, None);
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file(bucket_id: &str, path: &str) -> FileRecord {
        FileRecord {
            bucket_id: bucket_id.to_string(),
            path: path.to_string(),
            name: path.to_string(),
            size: 1,
            mime_type: "text/plain".to_string(),
            short_code: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_put_get_roundtrip() {
        let cache = Cache::new();
        cache.put_file(sample_file("bkt1", "a.txt"));
        assert!(cache.get_file("bkt1", "a.txt").is_some());
        assert!(cache.get_file("bkt1", "b.txt").is_none());
    }

    #[test]
    fn test_file_key_is_case_folded() {
        let cache = Cache::new();
        cache.put_file(sample_file("bkt1", "a.txt"));
        // Lookups with different case hit the same entry.
        assert!(cache.get_file("bkt1", "A.TXT").is_some());
    }

    #[test]
    fn test_expired_entry_is_dropped() {
        let cache = Cache::new();
        cache.put(
            "bucket:bkt1".to_string(),
            CachedValue::Stats(serde_json::json!({})),
            Duration::from_secs(0),
            Some("bkt1"),
        );
        assert!(cache.get("bucket:bkt1").is_none());
    }

    #[test]
    fn test_invalidate_single_key() {
        let cache = Cache::new();
        cache.put_file(sample_file("bkt1", "a.txt"));
        cache.invalidate(&file_key("bkt1", "a.txt"));
        assert!(cache.get_file("bkt1", "a.txt").is_none());
    }

    #[test]
    fn test_bulk_invalidation_by_prefix() {
        let cache = Cache::new();
        cache.put_file(sample_file("bkt1", "a.txt"));
        cache.put_file(sample_file("bkt1", "b.txt"));
        cache.put_bucket_detail("bkt1", serde_json::json!({"id": "bkt1"}));

        cache.invalidate_for("bkt1", "file:");
        assert!(cache.get_file("bkt1", "a.txt").is_none());
        assert!(cache.get_file("bkt1", "b.txt").is_none());
        // Bucket detail survives a file-prefix sweep.
        assert!(cache.get_bucket_detail("bkt1").is_some());
    }

    #[test]
    fn test_bucket_wide_invalidation() {
        let cache = Cache::new();
        cache.put_file(sample_file("bkt1", "a.txt"));
        cache.put_bucket_detail("bkt1", serde_json::json!({"id": "bkt1"}));
        cache.put_short_url(
            "code01",
            ShortResolution {
                bucket_id: "bkt1".to_string(),
                file_path: "a.txt".to_string(),
                bucket_expires_at: None,
            },
        );
        cache.put_file(sample_file("bkt2", "other.txt"));

        cache.invalidate_bucket("bkt1");
        assert!(cache.get_file("bkt1", "a.txt").is_none());
        assert!(cache.get_bucket_detail("bkt1").is_none());
        assert!(cache.get_short_url("code01").is_none());
        // Other buckets are untouched.
        assert!(cache.get_file("bkt2", "other.txt").is_some());
    }

    #[test]
    fn test_stats_invalidation() {
        let cache = Cache::new();
        cache.put_stats(serde_json::json!({"total_buckets": 1}));
        assert!(cache.get_stats().is_some());
        cache.invalidate_stats();
        assert!(cache.get_stats().is_none());
    }
}
