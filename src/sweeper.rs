//! Expired-bucket cleanup sweeper.
//!
//! One background task scans for buckets past their expiry on a fixed
//! interval and tears each one down through the same path as an explicit
//! delete (rows, blob tree, cache, notification).  A pass over a clean
//! database is a no-op, and a failed bucket is retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use tracing::{info, warn};

use crate::handlers::bucket::delete_bucket_contents;
use crate::metrics::SWEPT_BUCKETS_TOTAL;
use crate::AppState;

/// Run the sweeper until the process exits.
pub async fn run(state: Arc<AppState>, interval_minutes: u64) {
    let period = Duration::from_secs(interval_minutes.max(1) * 60);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so startup stays quick.
    ticker.tick().await;

    info!(interval_minutes, "cleanup sweeper started");
    loop {
        ticker.tick().await;
        if let Err(e) = sweep_once(&state).await {
            warn!(error = %e, "cleanup pass failed");
        }
    }
}

/// Delete every expired bucket. Returns how many were removed.
pub async fn sweep_once(state: &AppState) -> anyhow::Result<usize> {
    let expired = state.metadata.list_expired(Utc::now()).await?;
    if expired.is_empty() {
        return Ok(0);
    }

    let mut removed = 0;
    for bucket in &expired {
        match delete_bucket_contents(state, bucket).await {
            Ok(()) => {
                counter!(SWEPT_BUCKETS_TOTAL).increment(1);
                removed += 1;
            }
            Err(e) => {
                warn!(bucket = %bucket.id, error = %e, "failed to sweep bucket");
            }
        }
    }

    state.cache.invalidate_stats();
    info!(removed, "cleanup pass finished");
    Ok(removed)
}

// -- Tests --------------------------------------------------------------------
