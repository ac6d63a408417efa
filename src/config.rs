//! Configuration loading and types for CarbonFiles.
//!
//! Configuration is read from a YAML file, deserialized into the
//! [`Config`] struct, and then overlaid with `CARBONFILES_`-prefixed
//! environment variables.  Each subsection governs a different part of
//! the system: networking, credentials, metadata persistence, blob
//! storage, and the cleanup sweeper.

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Credential settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Metadata store settings.
    #[serde(default)]
    pub metadata: MetadataConfig,

    /// Blob storage settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Expired-bucket sweeper settings.
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings (Prometheus metrics).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum request body size in bytes. 0 means unlimited.
    #[serde(default)]
    pub max_upload_size: u64,

    /// CORS allowlist: `*` or a comma-separated list of origins.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_upload_size: 0,
            cors_origins: default_cors_origins(),
        }
    }
}

/// Credential configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthConfig {
    /// Long-lived admin credential. Required and non-empty.
    #[serde(default)]
    pub admin_key: String,

    /// Signing secret for dashboard credentials. Falls back to `admin_key`.
    #[serde(default)]
    pub jwt_secret: String,
}

impl AuthConfig {
    /// The secret used to sign and verify dashboard credentials.
    pub fn signing_secret(&self) -> &str {
        if self.jwt_secret.is_empty() {
            &self.admin_key
        } else {
            &self.jwt_secret
        }
    }
}

/// Metadata store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetadataConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Blob storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory for stored blobs.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Expired-bucket sweeper configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// Minutes between sweeper passes.
    #[serde(default = "default_cleanup_interval")]
    pub interval_minutes: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_cleanup_interval(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and the `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8675
}

fn default_cors_origins() -> String {
    "*".to_string()
}

fn default_db_path() -> String {
    "./data/carbonfiles.db".to_string()
}

fn default_data_dir() -> String {
    "./data/blobs".to_string()
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load configuration from a YAML file at `path`, apply environment
/// overrides, and validate it.
///
/// A missing file is not an error: the defaults plus environment variables
/// must still produce a valid configuration (`CARBONFILES_ADMIN_KEY` alone
/// is enough to run).
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let mut config: Config = match std::fs::read_to_string(path.as_ref()) {
        Ok(contents) => serde_yaml::from_str(&contents)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
        Err(e) => return Err(e.into()),
    };

    apply_env_overrides(&mut config);

    if config.auth.admin_key.trim().is_empty() {
        anyhow::bail!(
            "auth.admin_key is required (set it in the config file or via CARBONFILES_ADMIN_KEY)"
        );
    }

    Ok(config)
}

/// Overlay `CARBONFILES_*` environment variables onto a parsed config.
fn apply_env_overrides(config: &mut Config) {
    if let Ok(v) = std::env::var("CARBONFILES_HOST") {
        config.server.host = v;
    }
    if let Ok(v) = std::env::var("CARBONFILES_PORT") {
        if let Ok(port) = v.parse() {
            config.server.port = port;
        }
    }
    if let Ok(v) = std::env::var("CARBONFILES_ADMIN_KEY") {
        config.auth.admin_key = v;
    }
    if let Ok(v) = std::env::var("CARBONFILES_JWT_SECRET") {
        config.auth.jwt_secret = v;
    }
    if let Ok(v) = std::env::var("CARBONFILES_DB_PATH") {
        config.metadata.db_path = v;
    }
    if let Ok(v) = std::env::var("CARBONFILES_DATA_DIR") {
        config.storage.data_dir = v;
    }
    if let Ok(v) = std::env::var("CARBONFILES_MAX_UPLOAD_SIZE") {
        if let Ok(size) = v.parse() {
            config.server.max_upload_size = size;
        }
    }
    if let Ok(v) = std::env::var("CARBONFILES_CLEANUP_INTERVAL_MINUTES") {
        if let Ok(minutes) = v.parse() {
            config.cleanup.interval_minutes = minutes;
        }
    }
    if let Ok(v) = std::env::var("CARBONFILES_CORS_ORIGINS") {
        config.server.cors_origins = v;
    }
}

// -- Tests -------------------------------------------------------------------
