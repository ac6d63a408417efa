//! CarbonFiles library — multi-tenant file sharing engine.
//!
//! This crate provides the core components for running the CarbonFiles
//! server: request handling, credential resolution, bucket/file metadata,
//! blob storage on the local filesystem, an eagerly-invalidated cache,
//! a notification hub, and the expired-bucket sweeper.

use std::sync::Arc;
use std::time::Instant;

pub mod auth;
pub mod cache;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod hub;
pub mod ids;
pub mod metadata;
pub mod metrics;
pub mod server;
pub mod storage;
pub mod sweeper;

use crate::cache::Cache;
use crate::config::Config;
use crate::hub::NotificationHub;
use crate::metadata::store::MetadataStore;
use crate::storage::fs::BlobStore;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Metadata store (buckets, files, keys, tokens, short codes).
    pub metadata: Arc<dyn MetadataStore>,
    /// Blob storage on the local filesystem.
    pub blobs: BlobStore,
    /// Process-local metadata cache with eager invalidation.
    pub cache: Cache,
    /// Pub/sub hub for change notifications.
    pub hub: NotificationHub,
    /// Short-lived API-key resolution cache.
    pub auth_cache: auth::AuthCache,
    /// Process start instant, for uptime reporting.
    pub started_at: Instant,
}
