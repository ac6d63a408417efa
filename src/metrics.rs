//! Prometheus metrics for CarbonFiles.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides a Tower-compatible middleware for
//! HTTP RED metrics, and exposes the `/metrics` endpoint handler.
//!
//! The middleware never buffers bodies: uploads and downloads are
//! streamed, so only request counts and latencies are recorded here.

use axum::http::Request;
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "carbonfiles_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "carbonfiles_http_request_duration_seconds";

/// Total upload operations committed (counter).
pub const UPLOADS_TOTAL: &str = "carbonfiles_uploads_total";

/// Total content downloads served (counter).
pub const DOWNLOADS_TOTAL: &str = "carbonfiles_downloads_total";

/// Total buckets deleted by the cleanup sweeper (counter).
pub const SWEPT_BUCKETS_TOTAL: &str = "carbonfiles_swept_buckets_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times (e.g. in tests). Returns a reference to the global handle.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(UPLOADS_TOTAL, "Total files committed by uploads");
    describe_counter!(DOWNLOADS_TOTAL, "Total content downloads served");
    describe_counter!(SWEPT_BUCKETS_TOTAL, "Total expired buckets removed");
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation to avoid feedback loops.
/// Must be the outermost layer so it captures the full request lifecycle.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let method = req.method().to_string();
    let raw_path = req.uri().path().to_string();
    if raw_path == "/metrics" {
        return next.run(req).await;
    }
    let path = normalize_path(&raw_path);

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status)
        .increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path)
        .record(duration);

    response
}

/// Collapse identifier segments so metric cardinality stays bounded.
fn normalize_path(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("/api/buckets/") {
        let mut segments = rest.splitn(2, '/');
        let _id = segments.next();
        return match segments.next() {
            None => "/api/buckets/{id}".to_string(),
            Some(tail) if tail.starts_with("files/") => {
                if tail.ends_with("/content") {
                    "/api/buckets/{id}/files/{path}/content".to_string()
                } else {
                    "/api/buckets/{id}/files/{path}".to_string()
                }
            }
            Some("summary") => "/api/buckets/{id}/summary".to_string(),
            Some("zip") => "/api/buckets/{id}/zip".to_string(),
            Some("files") => "/api/buckets/{id}/files".to_string(),
            Some("upload") => "/api/buckets/{id}/upload".to_string(),
            Some("upload/stream") => "/api/buckets/{id}/upload/stream".to_string(),
            Some("tokens") => "/api/buckets/{id}/tokens".to_string(),
            Some(_) => "/api/buckets/{id}/other".to_string(),
        };
    }
    if path.starts_with("/s/") {
        return "/s/{code}".to_string();
    }
    if path.starts_with("/api/short/") {
        return "/api/short/{code}".to_string();
    }
    if let Some(rest) = path.strip_prefix("/api/keys/") {
        if rest.ends_with("/usage") {
            return "/api/keys/{prefix}/usage".to_string();
        }
        return "/api/keys/{prefix}".to_string();
    }
    path.to_string()
}

// -- /metrics endpoint --------------------------------------------------------

/// `GET /metrics` -- render the Prometheus exposition format.
pub async fn metrics_handler() -> Response {
    let handle = init_metrics();
    (
        [("content-type", "text/plain; version=0.0.4")],
        handle.render(),
    )
        .into_response()
}

// -- Tests --------------------------------------------------------------------
