//! CarbonFiles -- multi-tenant file sharing service.
//!
//! Startup is idempotent: the data directory and database parent are
//! created if missing, the schema bootstrap re-runs on every start, and
//! SIGTERM/SIGINT stop accepting connections and drain in-flight
//! requests before exit.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tracing::info;

/// Command-line arguments for the CarbonFiles server.
#[derive(Parser, Debug)]
#[command(
    name = "carbonfiles",
    version,
    about = "Multi-tenant file sharing service"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "carbonfiles.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing / logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    info!("Loading configuration from {}", cli.config);
    let config = carbonfiles::config::load_config(&cli.config)?;

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    if config.observability.metrics {
        carbonfiles::metrics::init_metrics();
        carbonfiles::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    // Metadata store (SQLite). Ensure the parent directory exists.
    let db_path = &config.metadata.db_path;
    if let Some(parent) = std::path::Path::new(db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let metadata = carbonfiles::metadata::sqlite::SqliteMetadataStore::new(db_path)?;
    info!("SQLite metadata store initialized at {}", db_path);

    // Blob store.
    let blobs = carbonfiles::storage::fs::BlobStore::new(&config.storage.data_dir)?;
    info!("Blob store initialized at {}", config.storage.data_dir);

    let cleanup_interval = config.cleanup.interval_minutes;

    let state = Arc::new(carbonfiles::AppState {
        config,
        metadata: Arc::new(metadata),
        blobs,
        cache: carbonfiles::cache::Cache::new(),
        hub: carbonfiles::hub::NotificationHub::new(),
        auth_cache: carbonfiles::auth::AuthCache::new(),
        started_at: Instant::now(),
    });

    // The sweeper runs on its own task; a missed tick is picked up by
    // the next one.
    tokio::spawn(carbonfiles::sweeper::run(state.clone(), cleanup_interval));

    let app = carbonfiles::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("CarbonFiles listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("CarbonFiles shut down");

    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}
