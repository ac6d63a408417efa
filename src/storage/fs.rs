//! Filesystem blob store.
//!
//! Blobs live at `{data_dir}/{bucket_id}/{encoded_path}` where
//! `encoded_path` is the percent-encoded lowercased logical path.  Path
//! separators are encoded too, so every blob sits flat inside its bucket
//! directory and bucket deletion is a single tree removal.
//!
//! Full writes follow the temp-fsync-rename discipline: any failure
//! before the rename leaves no visible file, and readers of a concurrent
//! re-upload always see a complete previous version.  Partial writes
//! take a per-blob exclusive lock for their whole duration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex as AsyncMutex;

/// Everything except `[A-Za-z0-9]`, `.`, `_`, and `-` is percent-encoded,
/// including `/`, which keeps the bucket directory flat.
const BLOB_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'_')
    .remove(b'-');

/// Marker error carried through `anyhow` when a write exceeds the
/// configured upload size; the HTTP layer downcasts it into a 413.
#[derive(Debug, thiserror::Error)]
#[error("request body exceeds the maximum upload size")]
pub struct PayloadTooLarge;

/// Result of a partial write.
#[derive(Debug, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The patch was applied; the blob now has this length.
    Written { new_size: u64 },
    /// No blob exists at the target path.
    Missing,
    /// The requested offset lies beyond the current size.
    Unsatisfiable { size: u64 },
}

/// Stores blobs on the local filesystem.
pub struct BlobStore {
    /// Root directory for all buckets.
    root: PathBuf,
    /// Per-blob locks serializing partial writes.
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl BlobStore {
    /// Create a new `BlobStore` rooted at `root`.
    ///
    /// The directory will be created if it does not exist.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Encode a logical path for use as an on-disk file name.
    pub fn encode_path(path: &str) -> String {
        utf8_percent_encode(&path.to_lowercase(), BLOB_ENCODE_SET).to_string()
    }

    /// Resolve `(bucket, path)` to the blob's absolute location.
    fn blob_path(&self, bucket_id: &str, path: &str) -> PathBuf {
        self.root.join(bucket_id).join(Self::encode_path(path))
    }

    /// Fetch (or create) the lock guarding one blob's partial writes.
    fn lock_for(&self, bucket_id: &str, path: &str) -> Arc<AsyncMutex<()>> {
        let key = format!("{}/{}", bucket_id, Self::encode_path(path));
        let mut locks = self.locks.lock().expect("mutex poisoned");
        locks.entry(key).or_default().clone()
    }

    /// Stream `body` into the blob at `(bucket_id, path)` atomically.
    ///
    /// The data is written to a uniquely-named temp file beside the
    /// target and renamed over it only after a successful fsync, so a
    /// failure mid-stream leaves no visible file.  Returns the final
    /// byte count.
    pub async fn store_atomic<S>(
        &self,
        bucket_id: &str,
        path: &str,
        mut body: S,
    ) -> anyhow::Result<u64>
    where
        S: Stream<Item = anyhow::Result<Bytes>> + Unpin,
    {
        let final_path = self.blob_path(bucket_id, path);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp_path = final_path.with_file_name(format!(
            "{}.tmp.{}",
            final_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            uuid::Uuid::new_v4()
        ));

        let result = async {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp_path)
                .await?;

            let mut written: u64 = 0;
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }

            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp_path, &final_path).await?;
            Ok(written)
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&tmp_path).await;
        }
        result
    }

    /// Open a blob for shared reading. Returns the handle and its length,
    /// or `None` if no blob exists.
    pub async fn open_read(
        &self,
        bucket_id: &str,
        path: &str,
    ) -> anyhow::Result<Option<(fs::File, u64)>> {
        let blob_path = self.blob_path(bucket_id, path);
        match fs::File::open(&blob_path).await {
            Ok(file) => {
                let len = file.metadata().await?.len();
                Ok(Some((file, len)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Overwrite a byte range of an existing blob, or append to it.
    ///
    /// The blob's lock is held for the whole patch, so no concurrent
    /// patch interleaves and no reader races a half-applied range
    /// through this store.  Non-append offsets must satisfy
    /// `offset <= current size`.
    pub async fn patch_file<S>(
        &self,
        bucket_id: &str,
        path: &str,
        mut body: S,
        offset: u64,
        append: bool,
    ) -> anyhow::Result<PatchOutcome>
    where
        S: Stream<Item = anyhow::Result<Bytes>> + Unpin,
    {
        let lock = self.lock_for(bucket_id, path);
        let _guard = lock.lock().await;

        let blob_path = self.blob_path(bucket_id, path);
        let mut file = match fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&blob_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PatchOutcome::Missing)
            }
            Err(e) => return Err(e.into()),
        };

        let size = file.metadata().await?.len();

        if append {
            file.seek(SeekFrom::End(0)).await?;
        } else {
            if offset > size {
                return Ok(PatchOutcome::Unsatisfiable { size });
            }
            file.seek(SeekFrom::Start(offset)).await?;
        }

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;

        let new_size = file.metadata().await?.len();
        Ok(PatchOutcome::Written { new_size })
    }

    /// Best-effort removal of one blob. Silent if already gone.
    pub async fn delete_blob(&self, bucket_id: &str, path: &str) -> anyhow::Result<()> {
        let blob_path = self.blob_path(bucket_id, path);
        match fs::remove_file(&blob_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Recursive removal of the whole bucket directory. Silent if absent.
    pub async fn delete_bucket_tree(&self, bucket_id: &str) -> anyhow::Result<()> {
        let dir = self.root.join(bucket_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// -- Tests --------------------------------------------------------------------
