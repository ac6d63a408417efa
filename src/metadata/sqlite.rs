//! SQLite-backed metadata store.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite
//! library is required.  All async trait methods are thin wrappers
//! around synchronous rusqlite calls executed under a `Mutex`.
//!
//! Timestamps are stored as INTEGER Unix milliseconds.  No foreign keys
//! are declared: cascades run in service code so blob cleanup and cache
//! invalidation stay aligned with row deletion.

use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::store::{
    ApiKeyRecord, BucketListQuery, BucketPatch, BucketRecord, FileListQuery, FileRecord,
    KeyUsage, MetadataStore, OwnerUsage, ShortUrlRecord, StatsTotals, UploadTokenRecord,
};

/// Metadata store backed by a single SQLite database file.
pub struct SqliteMetadataStore {
    /// The database connection, guarded by a mutex for Send + Sync.
    conn: Mutex<Connection>,
}

impl SqliteMetadataStore {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// Passing `":memory:"` creates an in-memory database (useful for tests).
    pub fn new(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.apply_pragmas()?;
        store.init_db()?;
        Ok(store)
    }

    /// Apply recommended SQLite pragmas for performance and safety.
    fn apply_pragmas(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        Ok(())
    }

    /// Create the required tables and indexes if they do not already exist.
    /// Idempotent, safe to run on every startup.
    fn init_db(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            -- Buckets
            CREATE TABLE IF NOT EXISTS buckets (
                id               TEXT PRIMARY KEY,
                name             TEXT NOT NULL,
                description      TEXT,
                owner            TEXT NOT NULL,
                owner_key_prefix TEXT,
                created_at       INTEGER NOT NULL,
                expires_at       INTEGER,
                last_used_at     INTEGER,
                file_count       INTEGER NOT NULL DEFAULT 0,
                total_size       INTEGER NOT NULL DEFAULT 0,
                download_count   INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_buckets_owner_key_prefix
                ON buckets(owner_key_prefix);
            CREATE INDEX IF NOT EXISTS idx_buckets_expires_at
                ON buckets(expires_at);
            CREATE INDEX IF NOT EXISTS idx_buckets_owner
                ON buckets(owner);

            -- Files
            CREATE TABLE IF NOT EXISTS files (
                bucket_id   TEXT NOT NULL,
                path        TEXT NOT NULL,
                name        TEXT NOT NULL,
                size        INTEGER NOT NULL,
                mime_type   TEXT NOT NULL DEFAULT 'application/octet-stream',
                short_code  TEXT,
                created_at  INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL,

                PRIMARY KEY (bucket_id, path)
            );

            CREATE INDEX IF NOT EXISTS idx_files_bucket
                ON files(bucket_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_files_short_code
                ON files(short_code) WHERE short_code IS NOT NULL;

            -- Short URLs
            CREATE TABLE IF NOT EXISTS short_urls (
                code        TEXT PRIMARY KEY,
                bucket_id   TEXT NOT NULL,
                file_path   TEXT NOT NULL,
                created_at  INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_short_urls_bucket_path
                ON short_urls(bucket_id, file_path);

            -- API keys
            CREATE TABLE IF NOT EXISTS api_keys (
                prefix         TEXT PRIMARY KEY,
                hashed_secret  TEXT NOT NULL,
                name           TEXT NOT NULL,
                created_at     INTEGER NOT NULL,
                last_used_at   INTEGER
            );

            -- Upload tokens
            CREATE TABLE IF NOT EXISTS upload_tokens (
                token         TEXT PRIMARY KEY,
                bucket_id     TEXT NOT NULL,
                created_at    INTEGER NOT NULL,
                expires_at    INTEGER NOT NULL,
                max_uploads   INTEGER,
                uploads_used  INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_upload_tokens_bucket
                ON upload_tokens(bucket_id);
            ",
        )?;
        Ok(())
    }
}

// -- Timestamp helpers --------------------------------------------------------

fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn opt_millis(dt: Option<DateTime<Utc>>) -> Option<i64> {
    dt.map(to_millis)
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn opt_from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_millis)
}

// -- Row mappers --------------------------------------------------------------

fn bucket_from_row(row: &Row<'_>) -> rusqlite::Result<BucketRecord> {
    Ok(BucketRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        owner: row.get(3)?,
        owner_key_prefix: row.get(4)?,
        created_at: from_millis(row.get(5)?),
        expires_at: opt_from_millis(row.get(6)?),
        last_used_at: opt_from_millis(row.get(7)?),
        file_count: row.get(8)?,
        total_size: row.get(9)?,
        download_count: row.get(10)?,
    })
}

const BUCKET_COLUMNS: &str = "id, name, description, owner, owner_key_prefix, created_at, \
     expires_at, last_used_at, file_count, total_size, download_count";

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        bucket_id: row.get(0)?,
        path: row.get(1)?,
        name: row.get(2)?,
        size: row.get(3)?,
        mime_type: row.get(4)?,
        short_code: row.get(5)?,
        created_at: from_millis(row.get(6)?),
        updated_at: from_millis(row.get(7)?),
    })
}

const FILE_COLUMNS: &str =
    "bucket_id, path, name, size, mime_type, short_code, created_at, updated_at";

// -- MetadataStore implementation ----------------------------------------------

type BoxFuture<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<T>> + Send + 'a>>;

impl MetadataStore for SqliteMetadataStore {
    // -- Health --------------------------------------------------------------

    fn ping(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
    }

    // -- Buckets -------------------------------------------------------------

    fn create_bucket(&self, record: BucketRecord) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "INSERT INTO buckets (id, name, description, owner, owner_key_prefix,
                     created_at, expires_at, last_used_at, file_count, total_size, download_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    record.id,
                    record.name,
                    record.description,
                    record.owner,
                    record.owner_key_prefix,
                    to_millis(record.created_at),
                    opt_millis(record.expires_at),
                    opt_millis(record.last_used_at),
                    record.file_count,
                    record.total_size,
                    record.download_count,
                ],
            )?;
            Ok(())
        })
    }

    fn get_bucket(&self, id: &str) -> BoxFuture<'_, Option<BucketRecord>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let result = conn
                .query_row(
                    &format!("SELECT {BUCKET_COLUMNS} FROM buckets WHERE id = ?1"),
                    params![id],
                    bucket_from_row,
                )
                .optional()?;
            Ok(result)
        })
    }

    fn bucket_id_exists(&self, id: &str) -> BoxFuture<'_, bool> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM buckets WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    fn list_buckets(
        &self,
        query: BucketListQuery,
    ) -> BoxFuture<'_, (Vec<BucketRecord>, i64)> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let now = to_millis(Utc::now());

            // An empty owner string means "any owner"; include_expired
            // short-circuits the expiry condition.
            let where_clause = "WHERE (?1 = '' OR owner = ?1)
                   AND (?2 = 1 OR expires_at IS NULL OR expires_at > ?3)";
            let owner = query.owner.clone().unwrap_or_default();
            let include_expired = i64::from(query.include_expired);

            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM buckets {where_clause}"),
                params![owner, include_expired, now],
                |row| row.get(0),
            )?;

            let sql = format!(
                "SELECT {BUCKET_COLUMNS} FROM buckets {where_clause}
                 ORDER BY {} {} LIMIT ?4 OFFSET ?5",
                query.sort.sql(),
                query.order.sql(),
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![owner, include_expired, now, query.limit, query.offset],
                bucket_from_row,
            )?;

            let mut buckets = Vec::new();
            for row in rows {
                buckets.push(row?);
            }
            Ok((buckets, total))
        })
    }

    fn update_bucket(&self, id: &str, patch: BucketPatch) -> BoxFuture<'_, bool> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.unchecked_transaction()?;

            let existing = tx
                .query_row(
                    &format!("SELECT {BUCKET_COLUMNS} FROM buckets WHERE id = ?1"),
                    params![id],
                    bucket_from_row,
                )
                .optional()?;

            let Some(mut bucket) = existing else {
                return Ok(false);
            };

            if let Some(name) = patch.name {
                bucket.name = name;
            }
            if let Some(description) = patch.description {
                bucket.description = Some(description);
            }
            if let Some(expires_at) = patch.expires_at {
                bucket.expires_at = expires_at;
            }

            tx.execute(
                "UPDATE buckets SET name = ?2, description = ?3, expires_at = ?4 WHERE id = ?1",
                params![
                    id,
                    bucket.name,
                    bucket.description,
                    opt_millis(bucket.expires_at)
                ],
            )?;
            tx.commit()?;
            Ok(true)
        })
    }

    fn delete_bucket(&self, id: &str) -> BoxFuture<'_, ()> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute("DELETE FROM buckets WHERE id = ?1", params![id])?;
            Ok(())
        })
    }

    fn apply_file_delta(
        &self,
        id: &str,
        file_delta: i64,
        size_delta: i64,
    ) -> BoxFuture<'_, ()> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "UPDATE buckets
                 SET file_count = file_count + ?2, total_size = total_size + ?3
                 WHERE id = ?1",
                params![id, file_delta, size_delta],
            )?;
            Ok(())
        })
    }

    fn touch_bucket_last_used(&self, id: &str) -> BoxFuture<'_, ()> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "UPDATE buckets SET last_used_at = ?2 WHERE id = ?1",
                params![id, to_millis(Utc::now())],
            )?;
            Ok(())
        })
    }

    fn increment_download_count(&self, id: &str) -> BoxFuture<'_, ()> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "UPDATE buckets SET download_count = download_count + 1 WHERE id = ?1",
                params![id],
            )?;
            Ok(())
        })
    }

    fn list_expired(&self, now: DateTime<Utc>) -> BoxFuture<'_, Vec<BucketRecord>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let mut stmt = conn.prepare(&format!(
                "SELECT {BUCKET_COLUMNS} FROM buckets
                 WHERE expires_at IS NOT NULL AND expires_at <= ?1"
            ))?;
            let rows = stmt.query_map(params![to_millis(now)], bucket_from_row)?;
            let mut buckets = Vec::new();
            for row in rows {
                buckets.push(row?);
            }
            Ok(buckets)
        })
    }

    // -- Files ---------------------------------------------------------------

    fn insert_file(&self, record: FileRecord) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "INSERT INTO files (bucket_id, path, name, size, mime_type, short_code,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.bucket_id,
                    record.path,
                    record.name,
                    record.size,
                    record.mime_type,
                    record.short_code,
                    to_millis(record.created_at),
                    to_millis(record.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    fn get_file(&self, bucket_id: &str, path: &str) -> BoxFuture<'_, Option<FileRecord>> {
        let bucket_id = bucket_id.to_string();
        let path = path.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let result = conn
                .query_row(
                    &format!(
                        "SELECT {FILE_COLUMNS} FROM files WHERE bucket_id = ?1 AND path = ?2"
                    ),
                    params![bucket_id, path],
                    file_from_row,
                )
                .optional()?;
            Ok(result)
        })
    }

    fn update_file_size(
        &self,
        bucket_id: &str,
        path: &str,
        new_size: i64,
        updated_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Option<i64>> {
        let bucket_id = bucket_id.to_string();
        let path = path.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.unchecked_transaction()?;

            let old_size: Option<i64> = tx
                .query_row(
                    "SELECT size FROM files WHERE bucket_id = ?1 AND path = ?2",
                    params![bucket_id, path],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(old_size) = old_size else {
                return Ok(None);
            };

            tx.execute(
                "UPDATE files SET size = ?3, updated_at = ?4
                 WHERE bucket_id = ?1 AND path = ?2",
                params![bucket_id, path, new_size, to_millis(updated_at)],
            )?;
            // Keep the bucket aggregate in step within the same transaction.
            tx.execute(
                "UPDATE buckets SET total_size = total_size + ?2 WHERE id = ?1",
                params![bucket_id, new_size - old_size],
            )?;
            tx.commit()?;
            Ok(Some(old_size))
        })
    }

    fn delete_file(
        &self,
        bucket_id: &str,
        path: &str,
    ) -> BoxFuture<'_, Option<FileRecord>> {
        let bucket_id = bucket_id.to_string();
        let path = path.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let tx = conn.unchecked_transaction()?;

            let existing = tx
                .query_row(
                    &format!(
                        "SELECT {FILE_COLUMNS} FROM files WHERE bucket_id = ?1 AND path = ?2"
                    ),
                    params![bucket_id, path],
                    file_from_row,
                )
                .optional()?;

            let Some(record) = existing else {
                return Ok(None);
            };

            tx.execute(
                "DELETE FROM files WHERE bucket_id = ?1 AND path = ?2",
                params![bucket_id, path],
            )?;
            tx.execute(
                "UPDATE buckets
                 SET file_count = file_count - 1, total_size = total_size - ?2
                 WHERE id = ?1",
                params![bucket_id, record.size],
            )?;
            tx.commit()?;
            Ok(Some(record))
        })
    }

    fn list_files(
        &self,
        bucket_id: &str,
        query: FileListQuery,
    ) -> BoxFuture<'_, (Vec<FileRecord>, i64)> {
        let bucket_id = bucket_id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");

            let total: i64 = conn.query_row(
                "SELECT COUNT(*) FROM files WHERE bucket_id = ?1",
                params![bucket_id],
                |row| row.get(0),
            )?;

            let sql = format!(
                "SELECT {FILE_COLUMNS} FROM files WHERE bucket_id = ?1
                 ORDER BY {} {} LIMIT ?2 OFFSET ?3",
                query.sort.sql(),
                query.order.sql(),
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows =
                stmt.query_map(params![bucket_id, query.limit, query.offset], file_from_row)?;

            let mut files = Vec::new();
            for row in rows {
                files.push(row?);
            }
            Ok((files, total))
        })
    }

    fn files_for_bucket(&self, bucket_id: &str) -> BoxFuture<'_, Vec<FileRecord>> {
        let bucket_id = bucket_id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let mut stmt = conn.prepare(&format!(
                "SELECT {FILE_COLUMNS} FROM files WHERE bucket_id = ?1 ORDER BY path"
            ))?;
            let rows = stmt.query_map(params![bucket_id], file_from_row)?;
            let mut files = Vec::new();
            for row in rows {
                files.push(row?);
            }
            Ok(files)
        })
    }

    fn delete_files_for_bucket(&self, bucket_id: &str) -> BoxFuture<'_, ()> {
        let bucket_id = bucket_id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute("DELETE FROM files WHERE bucket_id = ?1", params![bucket_id])?;
            Ok(())
        })
    }

    // -- API keys ------------------------------------------------------------

    fn insert_api_key(&self, record: ApiKeyRecord) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "INSERT INTO api_keys (prefix, hashed_secret, name, created_at, last_used_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.prefix,
                    record.hashed_secret,
                    record.name,
                    to_millis(record.created_at),
                    opt_millis(record.last_used_at),
                ],
            )?;
            Ok(())
        })
    }

    fn get_api_key(&self, prefix: &str) -> BoxFuture<'_, Option<ApiKeyRecord>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let result = conn
                .query_row(
                    "SELECT prefix, hashed_secret, name, created_at, last_used_at
                     FROM api_keys WHERE prefix = ?1",
                    params![prefix],
                    |row| {
                        Ok(ApiKeyRecord {
                            prefix: row.get(0)?,
                            hashed_secret: row.get(1)?,
                            name: row.get(2)?,
                            created_at: from_millis(row.get(3)?),
                            last_used_at: opt_from_millis(row.get(4)?),
                        })
                    },
                )
                .optional()?;
            Ok(result)
        })
    }

    fn list_api_keys(&self) -> BoxFuture<'_, Vec<ApiKeyRecord>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let mut stmt = conn.prepare(
                "SELECT prefix, hashed_secret, name, created_at, last_used_at
                 FROM api_keys ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(ApiKeyRecord {
                    prefix: row.get(0)?,
                    hashed_secret: row.get(1)?,
                    name: row.get(2)?,
                    created_at: from_millis(row.get(3)?),
                    last_used_at: opt_from_millis(row.get(4)?),
                })
            })?;
            let mut keys = Vec::new();
            for row in rows {
                keys.push(row?);
            }
            Ok(keys)
        })
    }

    fn delete_api_key(&self, prefix: &str) -> BoxFuture<'_, bool> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let changed =
                conn.execute("DELETE FROM api_keys WHERE prefix = ?1", params![prefix])?;
            Ok(changed > 0)
        })
    }

    fn touch_api_key(&self, prefix: &str) -> BoxFuture<'_, ()> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "UPDATE api_keys SET last_used_at = ?2 WHERE prefix = ?1",
                params![prefix, to_millis(Utc::now())],
            )?;
            Ok(())
        })
    }

    fn key_usage(&self, prefix: &str) -> BoxFuture<'_, KeyUsage> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let usage = conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(file_count), 0),
                        COALESCE(SUM(total_size), 0),
                        COALESCE(SUM(download_count), 0)
                 FROM buckets WHERE owner_key_prefix = ?1",
                params![prefix],
                |row| {
                    Ok(KeyUsage {
                        bucket_count: row.get(0)?,
                        file_count: row.get(1)?,
                        total_size: row.get(2)?,
                        download_count: row.get(3)?,
                    })
                },
            )?;
            Ok(usage)
        })
    }

    // -- Short URLs ----------------------------------------------------------

    fn insert_short_url(&self, record: ShortUrlRecord) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let changed = conn.execute(
                "INSERT OR IGNORE INTO short_urls (code, bucket_id, file_path, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.code,
                    record.bucket_id,
                    record.file_path,
                    to_millis(record.created_at),
                ],
            )?;
            Ok(changed > 0)
        })
    }

    fn get_short_url(&self, code: &str) -> BoxFuture<'_, Option<ShortUrlRecord>> {
        let code = code.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let result = conn
                .query_row(
                    "SELECT code, bucket_id, file_path, created_at
                     FROM short_urls WHERE code = ?1",
                    params![code],
                    |row| {
                        Ok(ShortUrlRecord {
                            code: row.get(0)?,
                            bucket_id: row.get(1)?,
                            file_path: row.get(2)?,
                            created_at: from_millis(row.get(3)?),
                        })
                    },
                )
                .optional()?;
            Ok(result)
        })
    }

    fn delete_short_url(&self, code: &str) -> BoxFuture<'_, bool> {
        let code = code.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let changed =
                conn.execute("DELETE FROM short_urls WHERE code = ?1", params![code])?;
            Ok(changed > 0)
        })
    }

    fn delete_short_url_for_path(&self, bucket_id: &str, path: &str) -> BoxFuture<'_, ()> {
        let bucket_id = bucket_id.to_string();
        let path = path.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "DELETE FROM short_urls WHERE bucket_id = ?1 AND file_path = ?2",
                params![bucket_id, path],
            )?;
            Ok(())
        })
    }

    fn delete_short_urls_for_bucket(&self, bucket_id: &str) -> BoxFuture<'_, ()> {
        let bucket_id = bucket_id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "DELETE FROM short_urls WHERE bucket_id = ?1",
                params![bucket_id],
            )?;
            Ok(())
        })
    }

    // -- Upload tokens -------------------------------------------------------

    fn insert_upload_token(&self, record: UploadTokenRecord) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "INSERT INTO upload_tokens (token, bucket_id, created_at, expires_at,
                     max_uploads, uploads_used)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.token,
                    record.bucket_id,
                    to_millis(record.created_at),
                    to_millis(record.expires_at),
                    record.max_uploads,
                    record.uploads_used,
                ],
            )?;
            Ok(())
        })
    }

    fn get_upload_token(&self, token: &str) -> BoxFuture<'_, Option<UploadTokenRecord>> {
        let token = token.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let result = conn
                .query_row(
                    "SELECT token, bucket_id, created_at, expires_at, max_uploads, uploads_used
                     FROM upload_tokens WHERE token = ?1",
                    params![token],
                    |row| {
                        Ok(UploadTokenRecord {
                            token: row.get(0)?,
                            bucket_id: row.get(1)?,
                            created_at: from_millis(row.get(2)?),
                            expires_at: from_millis(row.get(3)?),
                            max_uploads: row.get(4)?,
                            uploads_used: row.get(5)?,
                        })
                    },
                )
                .optional()?;
            Ok(result)
        })
    }

    fn increment_token_usage(&self, token: &str, count: i64) -> BoxFuture<'_, ()> {
        let token = token.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "UPDATE upload_tokens SET uploads_used = uploads_used + ?2 WHERE token = ?1",
                params![token, count],
            )?;
            Ok(())
        })
    }

    fn delete_upload_tokens_for_bucket(&self, bucket_id: &str) -> BoxFuture<'_, ()> {
        let bucket_id = bucket_id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            conn.execute(
                "DELETE FROM upload_tokens WHERE bucket_id = ?1",
                params![bucket_id],
            )?;
            Ok(())
        })
    }

    // -- Stats ---------------------------------------------------------------

    fn stats_totals(&self) -> BoxFuture<'_, StatsTotals> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let (total_buckets, total_size, total_downloads): (i64, i64, i64) = conn
                .query_row(
                    "SELECT COUNT(*), COALESCE(SUM(total_size), 0),
                            COALESCE(SUM(download_count), 0)
                     FROM buckets",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?;
            let total_files: i64 =
                conn.query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
            let total_keys: i64 =
                conn.query_row("SELECT COUNT(*) FROM api_keys", [], |row| row.get(0))?;

            Ok(StatsTotals {
                total_buckets,
                total_files,
                total_size,
                total_keys,
                total_downloads,
            })
        })
    }

    fn storage_by_owner(&self, now: DateTime<Utc>) -> BoxFuture<'_, Vec<OwnerUsage>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let mut stmt = conn.prepare(
                "SELECT owner, COUNT(*), COALESCE(SUM(total_size), 0)
                 FROM buckets
                 WHERE expires_at IS NULL OR expires_at > ?1
                 GROUP BY owner ORDER BY owner",
            )?;
            let rows = stmt.query_map(params![to_millis(now)], |row| {
                Ok(OwnerUsage {
                    owner: row.get(0)?,
                    bucket_count: row.get(1)?,
                    total_size: row.get(2)?,
                })
            })?;
            let mut owners = Vec::new();
            for row in rows {
                owners.push(row?);
            }
            Ok(owners)
        })
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::store::{BucketSort, FileSort, SortOrder};
    use chrono::Duration;

    fn store() -> SqliteMetadataStore {
        SqliteMetadataStore::new(":memory:").expect("failed to open in-memory store")
    }

    fn bucket(id: &str, owner: &str, expires_at: Option<DateTime<Utc>>) -> BucketRecord {
        BucketRecord {
            id: id.to_string(),
            name: format!("{id}-name"),
            description: None,
            owner: owner.to_string(),
            owner_key_prefix: None,
            created_at: Utc::now(),
            expires_at,
            last_used_at: None,
            file_count: 0,
            total_size: 0,
            download_count: 0,
        }
    }

    fn file(bucket_id: &str, path: &str, size: i64) -> FileRecord {
        FileRecord {
            bucket_id: bucket_id.to_string(),
            path: path.to_string(),
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            size,
            mime_type: "text/plain".to_string(),
            short_code: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_schema_bootstrap_is_idempotent() {
        let s = store();
        s.init_db().unwrap();
        s.init_db().unwrap();
    }

    #[tokio::test]
    async fn test_bucket_roundtrip() {
        let s = store();
        s.create_bucket(bucket("abc123defg", "alice", None))
            .await
            .unwrap();

        let fetched = s.get_bucket("abc123defg").await.unwrap().unwrap();
        assert_eq!(fetched.name, "abc123defg-name");
        assert_eq!(fetched.owner, "alice");
        assert!(s.bucket_id_exists("abc123defg").await.unwrap());
        assert!(!s.bucket_id_exists("missing000").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_buckets_owner_filter() {
        let s = store();
        s.create_bucket(bucket("bucketaaaa", "alice", None)).await.unwrap();
        s.create_bucket(bucket("bucketbbbb", "bob", None)).await.unwrap();

        let (rows, total) = s
            .list_buckets(BucketListQuery {
                owner: Some("alice".to_string()),
                limit: 50,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].owner, "alice");
    }

    #[tokio::test]
    async fn test_list_buckets_excludes_expired() {
        let s = store();
        let past = Utc::now() - Duration::hours(1);
        s.create_bucket(bucket("liveliveli", "alice", None)).await.unwrap();
        s.create_bucket(bucket("deaddeadde", "alice", Some(past)))
            .await
            .unwrap();

        let (rows, total) = s
            .list_buckets(BucketListQuery {
                limit: 50,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].id, "liveliveli");

        let (rows, _) = s
            .list_buckets(BucketListQuery {
                include_expired: true,
                limit: 50,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_list_buckets_sorting() {
        let s = store();
        s.create_bucket(bucket("zebrabkt00", "alice", None)).await.unwrap();
        s.create_bucket(bucket("alphabkt00", "alice", None)).await.unwrap();

        let (rows, _) = s
            .list_buckets(BucketListQuery {
                sort: BucketSort::Name,
                order: SortOrder::Asc,
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rows[0].id, "alphabkt00");
        assert_eq!(rows[1].id, "zebrabkt00");
    }

    #[tokio::test]
    async fn test_list_files_sorting_and_paging() {
        let s = store();
        s.create_bucket(bucket("sortedbkt0", "alice", None)).await.unwrap();
        s.insert_file(file("sortedbkt0", "b.txt", 5)).await.unwrap();
        s.insert_file(file("sortedbkt0", "a.txt", 20)).await.unwrap();
        s.insert_file(file("sortedbkt0", "c.txt", 10)).await.unwrap();

        let (by_size, total) = s
            .list_files(
                "sortedbkt0",
                FileListQuery {
                    sort: FileSort::Size,
                    order: SortOrder::Desc,
                    limit: 2,
                    offset: 0,
                },
            )
            .await
            .unwrap();
        assert_eq!(total, 3);
        let paths: Vec<&str> = by_size.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "c.txt"]);

        let (by_path, _) = s
            .list_files(
                "sortedbkt0",
                FileListQuery {
                    sort: FileSort::Path,
                    order: SortOrder::Asc,
                    limit: 10,
                    offset: 1,
                },
            )
            .await
            .unwrap();
        assert_eq!(by_path[0].path, "b.txt");
    }

    #[tokio::test]
    async fn test_update_bucket_patch_semantics() {
        let s = store();
        s.create_bucket(bucket("patchmeple", "alice", None)).await.unwrap();

        let updated = s
            .update_bucket(
                "patchmeple",
                BucketPatch {
                    name: Some("renamed".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(updated);

        let fetched = s.get_bucket("patchmeple").await.unwrap().unwrap();
        assert_eq!(fetched.name, "renamed");
        assert_eq!(fetched.description, None);

        assert!(!s
            .update_bucket("nosuchbckt", BucketPatch::default())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_file_delete_adjusts_counters() {
        let s = store();
        s.create_bucket(bucket("counterbkt", "alice", None)).await.unwrap();
        s.insert_file(file("counterbkt", "a.txt", 10)).await.unwrap();
        s.apply_file_delta("counterbkt", 1, 10).await.unwrap();

        let b = s.get_bucket("counterbkt").await.unwrap().unwrap();
        assert_eq!(b.file_count, 1);
        assert_eq!(b.total_size, 10);

        let deleted = s.delete_file("counterbkt", "a.txt").await.unwrap().unwrap();
        assert_eq!(deleted.size, 10);

        let b = s.get_bucket("counterbkt").await.unwrap().unwrap();
        assert_eq!(b.file_count, 0);
        assert_eq!(b.total_size, 0);

        // Deleting again is a no-op returning None.
        assert!(s.delete_file("counterbkt", "a.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_file_size_propagates_to_bucket() {
        let s = store();
        s.create_bucket(bucket("resizebkt0", "alice", None)).await.unwrap();
        s.insert_file(file("resizebkt0", "f.bin", 100)).await.unwrap();
        s.apply_file_delta("resizebkt0", 1, 100).await.unwrap();

        let old = s
            .update_file_size("resizebkt0", "f.bin", 250, Utc::now())
            .await
            .unwrap();
        assert_eq!(old, Some(100));

        let b = s.get_bucket("resizebkt0").await.unwrap().unwrap();
        assert_eq!(b.total_size, 250);
        assert_eq!(b.file_count, 1);

        let f = s.get_file("resizebkt0", "f.bin").await.unwrap().unwrap();
        assert_eq!(f.size, 250);
    }

    #[tokio::test]
    async fn test_short_url_conflict_detection() {
        let s = store();
        let record = ShortUrlRecord {
            code: "abc123".to_string(),
            bucket_id: "bucketaaaa".to_string(),
            file_path: "a.txt".to_string(),
            created_at: Utc::now(),
        };
        assert!(s.insert_short_url(record.clone()).await.unwrap());
        // Same code again is reported as a conflict, not an error.
        assert!(!s.insert_short_url(record).await.unwrap());
    }

    #[tokio::test]
    async fn test_upload_token_usage_increment() {
        let s = store();
        let token = UploadTokenRecord {
            token: "cfu_testtoken".to_string(),
            bucket_id: "bucketaaaa".to_string(),
            created_at: Utc::now(),
            expires_at: Utc::now() + Duration::days(1),
            max_uploads: Some(2),
            uploads_used: 0,
        };
        s.insert_upload_token(token).await.unwrap();

        s.increment_token_usage("cfu_testtoken", 1).await.unwrap();
        s.increment_token_usage("cfu_testtoken", 1).await.unwrap();

        let fetched = s.get_upload_token("cfu_testtoken").await.unwrap().unwrap();
        assert_eq!(fetched.uploads_used, 2);
        assert!(!fetched.is_valid(Utc::now()));
    }

    #[tokio::test]
    async fn test_list_expired() {
        let s = store();
        let past = Utc::now() - Duration::minutes(5);
        let future = Utc::now() + Duration::minutes(5);
        s.create_bucket(bucket("expiredbkt", "alice", Some(past))).await.unwrap();
        s.create_bucket(bucket("futurebkt0", "alice", Some(future))).await.unwrap();
        s.create_bucket(bucket("foreverbkt", "alice", None)).await.unwrap();

        let expired = s.list_expired(Utc::now()).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "expiredbkt");
    }

    #[tokio::test]
    async fn test_stats_totals_and_owner_grouping() {
        let s = store();
        s.create_bucket(bucket("statsbkt01", "alice", None)).await.unwrap();
        s.create_bucket(bucket("statsbkt02", "bob", None)).await.unwrap();
        s.apply_file_delta("statsbkt01", 2, 300).await.unwrap();
        s.insert_file(file("statsbkt01", "x.txt", 100)).await.unwrap();
        s.insert_file(file("statsbkt01", "y.txt", 200)).await.unwrap();

        let totals = s.stats_totals().await.unwrap();
        assert_eq!(totals.total_buckets, 2);
        assert_eq!(totals.total_files, 2);
        assert_eq!(totals.total_size, 300);

        let owners = s.storage_by_owner(Utc::now()).await.unwrap();
        assert_eq!(owners.len(), 2);
        assert_eq!(owners[0].owner, "alice");
        assert_eq!(owners[0].total_size, 300);
    }

    #[tokio::test]
    async fn test_key_usage_aggregates_owned_buckets() {
        let s = store();
        let mut b = bucket("keyedbkt01", "alice", None);
        b.owner_key_prefix = Some("cf4_0011aabb".to_string());
        s.create_bucket(b).await.unwrap();
        s.apply_file_delta("keyedbkt01", 3, 512).await.unwrap();

        let usage = s.key_usage("cf4_0011aabb").await.unwrap();
        assert_eq!(usage.bucket_count, 1);
        assert_eq!(usage.file_count, 3);
        assert_eq!(usage.total_size, 512);
    }
}
