//! Axum router construction and middleware composition.
//!
//! The [`app`] function wires every endpoint to its handler and layers
//! the middleware stack: metrics (outermost) → forwarded-header capture
//! → CORS → credential resolution → routes.  The default axum body
//! limit is disabled; the upload handlers enforce the configured
//! `max_upload_size` themselves so bodies stay streamed.

use axum::{
    extract::{DefaultBodyLimit, Request, State},
    http::{header, HeaderValue},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, on, post, put, MethodFilter},
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::auth;
use crate::errors::ApiError;
use crate::handlers::{bucket, file, key, short_url, stats, token, upload, ws};
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

/// Build the axum [`Router`] with all routes and middleware.
pub fn app(state: Arc<AppState>) -> Router {
    let metrics_enabled = state.config.observability.metrics;
    let cors = cors_layer(&state.config.server.cors_origins);

    let mut stateful = Router::new()
        .route("/healthz", get(healthz))
        // API keys (admin)
        .route("/api/keys", post(key::create_key).get(key::list_keys))
        .route("/api/keys/:prefix", delete(key::delete_key))
        .route("/api/keys/:prefix/usage", get(key::key_usage))
        // Buckets
        .route(
            "/api/buckets",
            post(bucket::create_bucket).get(bucket::list_buckets),
        )
        .route(
            "/api/buckets/:id",
            get(bucket::get_bucket)
                .patch(bucket::update_bucket)
                .delete(bucket::delete_bucket),
        )
        .route("/api/buckets/:id/summary", get(bucket::bucket_summary))
        .route(
            "/api/buckets/:id/zip",
            on(MethodFilter::GET, bucket::zip_download)
                .on(MethodFilter::HEAD, bucket::zip_head),
        )
        // Files (metadata at the bare path, content at /content)
        .route("/api/buckets/:id/files", get(file::list_files))
        .route(
            "/api/buckets/:id/files/*path",
            on(MethodFilter::GET, file::get_file_or_content)
                .on(MethodFilter::HEAD, file::head_file_or_content)
                .on(MethodFilter::DELETE, file::delete_file)
                .on(MethodFilter::PATCH, upload::patch_content),
        )
        // Uploads
        .route("/api/buckets/:id/upload", post(upload::multipart_upload))
        .route("/api/buckets/:id/upload/stream", put(upload::stream_upload))
        .route("/api/buckets/:id/tokens", post(token::create_upload_token))
        // Dashboard credentials
        .route("/api/tokens/dashboard", post(token::create_dashboard_token))
        .route("/api/tokens/dashboard/me", get(token::dashboard_me))
        // Stats
        .route("/api/stats", get(stats::get_stats))
        // Short URLs
        .route("/s/:code", get(short_url::redirect_short_url))
        .route("/api/short/:code", delete(short_url::delete_short_url))
        // Notifications
        .route("/ws", get(ws::ws_handler));

    if metrics_enabled {
        stateful = stateful.route("/metrics", get(metrics_handler));
    }

    // Layer ordering: inner layers run closest to the handlers.
    let mut router = stateful
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(state, auth_middleware))
        .layer(cors)
        .layer(middleware::from_fn(forwarded_headers_middleware))
        .layer(TraceLayer::new_for_http());

    if metrics_enabled {
        router = router.layer(middleware::from_fn(metrics_middleware));
    }

    // Uploads can be large; the upload handlers enforce the cap.
    router.layer(DefaultBodyLimit::disable())
}

// -- CORS ---------------------------------------------------------------------

/// Build the CORS layer from the configured allowlist (`*` or a
/// comma-separated origin list).
fn cors_layer(origins: &str) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            header::CONTENT_RANGE,
            header::ACCEPT_RANGES,
            header::CONTENT_LENGTH,
            header::ETAG,
            header::LAST_MODIFIED,
        ]);

    if origins.trim() == "*" {
        layer.allow_origin(Any)
    } else {
        let allowed: Vec<HeaderValue> = origins
            .split(',')
            .filter_map(|origin| origin.trim().parse().ok())
            .collect();
        layer.allow_origin(allowed)
    }
}

// -- Middleware ---------------------------------------------------------------

/// The client address as seen through the trusted proxy.
#[derive(Debug, Clone)]
pub struct ForwardedClient {
    pub ip: Option<String>,
    pub proto: Option<String>,
}

/// Capture forwarded-IP/proto headers before anything else runs.
async fn forwarded_headers_middleware(mut req: Request, next: Next) -> Response {
    let ip = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string());
    let proto = req
        .headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if ip.is_some() || proto.is_some() {
        debug!(client_ip = ?ip, proto = ?proto, path = %req.uri().path(), "forwarded request");
    }
    req.extensions_mut().insert(ForwardedClient { ip, proto });

    next.run(req).await
}

/// Resolve the bearer credential and attach the [`auth::AuthContext`]
/// to the request.  Resolution never rejects here; route-level checks
/// decide what a Public caller may do.
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let bearer = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string());

    let context = auth::resolve(&state, bearer.as_deref()).await?;
    req.extensions_mut().insert(context);
    Ok(next.run(req).await)
}

// -- Health -------------------------------------------------------------------

/// `GET /healthz` -- 200 when the metadata store answers, else 503.
async fn healthz(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    state
        .metadata
        .ping()
        .await
        .map_err(|_| ApiError::StoreUnavailable)?;
    Ok(Json(serde_json::json!({
        "status": "ok",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
    .into_response())
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::config::Config;
    use crate::hub::NotificationHub;
    use crate::metadata::sqlite::SqliteMetadataStore;
    use crate::storage::fs::BlobStore;
    use axum::body::Body;
    use axum::http::StatusCode;
    use http::Request as HttpRequest;
    use std::io::Read;
    use std::time::Instant;
    use tower::ServiceExt;

    const ADMIN_KEY: &str = "test-admin-key";

    fn test_state(max_upload_size: u64) -> (Arc<AppState>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().expect("failed to create temp dir");

        let mut config: Config = serde_yaml::from_str("{}").expect("empty config");
        config.auth.admin_key = ADMIN_KEY.to_string();
        config.server.max_upload_size = max_upload_size;
        config.observability.metrics = false;

        let metadata = SqliteMetadataStore::new(":memory:").expect("in-memory store");
        let blobs = BlobStore::new(tmp.path().join("blobs")).expect("blob store");

        let state = Arc::new(AppState {
            config,
            metadata: Arc::new(metadata),
            blobs,
            cache: Cache::new(),
            hub: NotificationHub::new(),
            auth_cache: auth::AuthCache::new(),
            started_at: Instant::now(),
        });
        (state, tmp)
    }

    async fn send(router: &Router, req: HttpRequest<Body>) -> (StatusCode, Vec<u8>, axum::http::HeaderMap) {
        let response = router.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec(), headers)
    }

    fn admin_req(method: &str, uri: &str, body: Body) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {ADMIN_KEY}"))
            .header("content-type", "application/json")
            .body(body)
            .unwrap()
    }

    async fn create_bucket(router: &Router, name: &str) -> String {
        let (status, body, _) = send(
            router,
            admin_req(
                "POST",
                "/api/buckets",
                Body::from(format!("{{\"name\": \"{name}\"}}")),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        json["id"].as_str().unwrap().to_string()
    }

    async fn stream_upload(
        router: &Router,
        bucket: &str,
        filename: &str,
        content: Vec<u8>,
    ) -> serde_json::Value {
        let (status, body, _) = send(
            router,
            HttpRequest::builder()
                .method("PUT")
                .uri(format!(
                    "/api/buckets/{bucket}/upload/stream?filename={filename}"
                ))
                .header("authorization", format!("Bearer {ADMIN_KEY}"))
                .body(Body::from(content))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        serde_json::from_slice(&body).unwrap()
    }

    // -- Health ---------------------------------------------------------------

    #[tokio::test]
    async fn test_healthz_ok() {
        let (state, _tmp) = test_state(0);
        let router = app(state);
        let (status, body, _) = send(
            &router,
            HttpRequest::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    // -- Buckets --------------------------------------------------------------

    #[tokio::test]
    async fn test_bucket_lifecycle() {
        let (state, _tmp) = test_state(0);
        let router = app(state);

        let id = create_bucket(&router, "my bucket").await;

        let (status, body, _) = send(
            &router,
            HttpRequest::builder()
                .uri(format!("/api/buckets/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["name"], "my bucket");
        assert_eq!(json["owner"], "admin");
        assert_eq!(json["file_count"], 0);
        assert_eq!(json["files"].as_array().unwrap().len(), 0);
        assert_eq!(json["has_more_files"], false);

        // Update, then delete.
        let (status, _, _) = send(
            &router,
            admin_req(
                "PATCH",
                &format!("/api/buckets/{id}"),
                Body::from("{\"name\": \"renamed\"}"),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, _) = send(
            &router,
            admin_req("DELETE", &format!("/api/buckets/{id}"), Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _, _) = send(
            &router,
            HttpRequest::builder()
                .uri(format!("/api/buckets/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bucket_create_requires_credential() {
        let (state, _tmp) = test_state(0);
        let router = app(state);

        let (status, _, _) = send(
            &router,
            HttpRequest::builder()
                .method("POST")
                .uri("/api/buckets")
                .header("content-type", "application/json")
                .body(Body::from("{\"name\": \"nope\"}"))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_bucket_create_rejects_blank_name_and_bad_expiry() {
        let (state, _tmp) = test_state(0);
        let router = app(state);

        let (status, _, _) = send(
            &router,
            admin_req("POST", "/api/buckets", Body::from("{\"name\": \"  \"}")),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body, _) = send(
            &router,
            admin_req(
                "POST",
                "/api/buckets",
                Body::from("{\"name\": \"ok\", \"expires_in\": \"2y\"}"),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["error"].as_str().unwrap().contains("expiry"));
    }

    #[tokio::test]
    async fn test_expired_bucket_reads_as_missing() {
        let (state, _tmp) = test_state(0);
        let router = app(state);

        // Unix second 1 is long past.
        let (status, body, _) = send(
            &router,
            admin_req(
                "POST",
                "/api/buckets",
                Body::from("{\"name\": \"old\", \"expires_in\": \"1\"}"),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let id = json["id"].as_str().unwrap();

        let (status, _, _) = send(
            &router,
            HttpRequest::builder()
                .uri(format!("/api/buckets/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // Admin listing with include_expired still sees it.
        let (_, body, _) = send(
            &router,
            admin_req("GET", "/api/buckets?include_expired=true", Body::empty()),
        )
        .await;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["total"], 1);

        let (_, body, _) = send(&router, admin_req("GET", "/api/buckets", Body::empty())).await;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["total"], 0);
    }

    // -- Owner isolation ------------------------------------------------------

    async fn create_api_key(router: &Router, name: &str) -> String {
        let (status, body, _) = send(
            router,
            admin_req(
                "POST",
                "/api/keys",
                Body::from(format!("{{\"name\": \"{name}\"}}")),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        json["key"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_owner_sees_only_their_buckets() {
        let (state, _tmp) = test_state(0);
        let router = app(state);

        let key_a = create_api_key(&router, "owner-a").await;
        let key_b = create_api_key(&router, "owner-b").await;

        for key in [&key_a, &key_b] {
            let (status, _, _) = send(
                &router,
                HttpRequest::builder()
                    .method("POST")
                    .uri("/api/buckets")
                    .header("authorization", format!("Bearer {key}"))
                    .header("content-type", "application/json")
                    .body(Body::from("{\"name\": \"mine\"}"))
                    .unwrap(),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let (status, body, _) = send(
            &router,
            HttpRequest::builder()
                .uri("/api/buckets")
                .header("authorization", format!("Bearer {key_a}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["total"], 1);
        assert_eq!(json["buckets"][0]["owner"], "owner-a");

        // Admin sees both.
        let (_, body, _) = send(&router, admin_req("GET", "/api/buckets", Body::empty())).await;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["total"], 2);

        // owner-a cannot delete owner-b's bucket.
        let (_, body, _) = send(
            &router,
            admin_req("GET", "/api/buckets?sort=name", Body::empty()),
        )
        .await;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let foreign = json["buckets"]
            .as_array()
            .unwrap()
            .iter()
            .find(|b| b["owner"] == "owner-b")
            .unwrap()["id"]
            .as_str()
            .unwrap()
            .to_string();

        let (status, _, _) = send(
            &router,
            HttpRequest::builder()
                .method("DELETE")
                .uri(format!("/api/buckets/{foreign}"))
                .header("authorization", format!("Bearer {key_a}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    // -- Upload and download --------------------------------------------------

    #[tokio::test]
    async fn test_stream_upload_roundtrip() {
        let (state, _tmp) = test_state(0);
        let router = app(state);
        let id = create_bucket(&router, "files").await;

        let view = stream_upload(&router, &id, "hello.txt", b"hello world".to_vec()).await;
        assert_eq!(view["path"], "hello.txt");
        assert_eq!(view["size"], 11);
        assert_eq!(view["mime_type"], "text/plain");
        assert!(view["short_code"].as_str().unwrap().len() == 6);

        let (status, body, headers) = send(
            &router,
            HttpRequest::builder()
                .uri(format!("/api/buckets/{id}/files/hello.txt/content"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"hello world");
        assert_eq!(headers.get("content-type").unwrap(), "text/plain");
        assert_eq!(headers.get("accept-ranges").unwrap(), "bytes");
        assert_eq!(headers.get("content-length").unwrap(), "11");
    }

    #[tokio::test]
    async fn test_reupload_preserves_short_code() {
        let (state, _tmp) = test_state(0);
        let router = app(state);
        let id = create_bucket(&router, "files").await;

        let first = stream_upload(&router, &id, "keep.txt", b"v1".to_vec()).await;
        let second = stream_upload(&router, &id, "keep.txt", b"version 2".to_vec()).await;

        assert_eq!(first["short_code"], second["short_code"]);
        assert_eq!(second["size"], 9);
        assert_eq!(first["created_at"], second["created_at"]);

        // Aggregates reflect one file with the new size.
        let (_, body, _) = send(
            &router,
            HttpRequest::builder()
                .uri(format!("/api/buckets/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["file_count"], 1);
        assert_eq!(json["total_size"], 9);
    }

    #[tokio::test]
    async fn test_multipart_upload() {
        let (state, _tmp) = test_state(0);
        let router = app(state);
        let id = create_bucket(&router, "files").await;

        let boundary = "cfboundary42";
        let body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"Docs/Note.TXT\"\r\n\
             Content-Type: text/plain\r\n\r\n\
             first part\r\n\
             --{boundary}\r\n\
             Content-Disposition: form-data; name=\"reports/summary.md\"\r\n\r\n\
             second part\r\n\
             --{boundary}--\r\n"
        );

        let (status, body, _) = send(
            &router,
            HttpRequest::builder()
                .method("POST")
                .uri(format!("/api/buckets/{id}/upload"))
                .header("authorization", format!("Bearer {ADMIN_KEY}"))
                .header(
                    "content-type",
                    format!("multipart/form-data; boundary={boundary}"),
                )
                .body(Body::from(body))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let uploaded = json["uploaded"].as_array().unwrap();
        assert_eq!(uploaded.len(), 2);
        // File-ish field name: part filename (lowercased) is the path.
        assert_eq!(uploaded[0]["path"], "docs/note.txt");
        // Other field names are themselves the path.
        assert_eq!(uploaded[1]["path"], "reports/summary.md");

        let (status, content, _) = send(
            &router,
            HttpRequest::builder()
                .uri(format!("/api/buckets/{id}/files/docs/note.txt/content"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content, b"first part");
    }

    #[tokio::test]
    async fn test_upload_requires_authorization() {
        let (state, _tmp) = test_state(0);
        let router = app(state);
        let id = create_bucket(&router, "files").await;

        let (status, _, _) = send(
            &router,
            HttpRequest::builder()
                .method("PUT")
                .uri(format!("/api/buckets/{id}/upload/stream?filename=f.txt"))
                .body(Body::from("data"))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_max_upload_size_enforced() {
        let (state, _tmp) = test_state(16);
        let router = app(state);
        let id = create_bucket(&router, "small").await;

        let (status, _, _) = send(
            &router,
            HttpRequest::builder()
                .method("PUT")
                .uri(format!("/api/buckets/{id}/upload/stream?filename=big.bin"))
                .header("authorization", format!("Bearer {ADMIN_KEY}"))
                .body(Body::from(vec![0u8; 64]))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

        // Nothing was committed.
        let (_, body, _) = send(
            &router,
            HttpRequest::builder()
                .uri(format!("/api/buckets/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["file_count"], 0);
    }

    // -- Range and conditional ------------------------------------------------

    #[tokio::test]
    async fn test_range_seek() {
        let (state, _tmp) = test_state(0);
        let router = app(state);
        let id = create_bucket(&router, "ranges").await;

        let content: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        stream_upload(&router, &id, "range-test.bin", content.clone()).await;

        let (status, body, headers) = send(
            &router,
            HttpRequest::builder()
                .uri(format!("/api/buckets/{id}/files/range-test.bin/content"))
                .header("range", "bytes=0-99")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(headers.get("content-range").unwrap(), "bytes 0-99/1000");
        assert_eq!(headers.get("content-length").unwrap(), "100");
        assert_eq!(body, &content[0..100]);

        // Open-ended and suffix forms.
        let (status, body, headers) = send(
            &router,
            HttpRequest::builder()
                .uri(format!("/api/buckets/{id}/files/range-test.bin/content"))
                .header("range", "bytes=950-")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(headers.get("content-range").unwrap(), "bytes 950-999/1000");
        assert_eq!(body, &content[950..]);

        let (status, body, _) = send(
            &router,
            HttpRequest::builder()
                .uri(format!("/api/buckets/{id}/files/range-test.bin/content"))
                .header("range", "bytes=-100")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(body, &content[900..]);

        // Out-of-range start → 416 with the entity length.
        let (status, _, headers) = send(
            &router,
            HttpRequest::builder()
                .uri(format!("/api/buckets/{id}/files/range-test.bin/content"))
                .header("range", "bytes=1000-1100")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(headers.get("content-range").unwrap(), "bytes */1000");
    }

    #[tokio::test]
    async fn test_conditional_fetch() {
        let (state, _tmp) = test_state(0);
        let router = app(state);
        let id = create_bucket(&router, "cond").await;
        stream_upload(&router, &id, "hello.txt", b"Hello, World".to_vec()).await;

        let (status, _, headers) = send(
            &router,
            HttpRequest::builder()
                .uri(format!("/api/buckets/{id}/files/hello.txt/content"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let etag = headers.get("etag").unwrap().to_str().unwrap().to_string();
        assert!(etag.starts_with("\"12-"));

        let (status, body, _) = send(
            &router,
            HttpRequest::builder()
                .uri(format!("/api/buckets/{id}/files/hello.txt/content"))
                .header("if-none-match", etag.clone())
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_MODIFIED);
        assert!(body.is_empty());

        // If-Range mismatch downgrades to a 200 full body.
        let (status, body, _) = send(
            &router,
            HttpRequest::builder()
                .uri(format!("/api/buckets/{id}/files/hello.txt/content"))
                .header("range", "bytes=0-4")
                .header("if-range", "\"0-0\"")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"Hello, World");
    }

    #[tokio::test]
    async fn test_download_disposition_and_head() {
        let (state, _tmp) = test_state(0);
        let router = app(state);
        let id = create_bucket(&router, "dl").await;
        stream_upload(&router, &id, "report.pdf", b"%PDF".to_vec()).await;

        let (status, _, headers) = send(
            &router,
            HttpRequest::builder()
                .uri(format!(
                    "/api/buckets/{id}/files/report.pdf/content?download=true"
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            headers.get("content-disposition").unwrap(),
            "attachment; filename=\"report.pdf\""
        );

        let (status, body, headers) = send(
            &router,
            HttpRequest::builder()
                .method("HEAD")
                .uri(format!("/api/buckets/{id}/files/report.pdf/content"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
        assert_eq!(headers.get("content-length").unwrap(), "4");
        assert_eq!(headers.get("content-type").unwrap(), "application/pdf");
    }

    // -- PATCH content --------------------------------------------------------

    #[tokio::test]
    async fn test_patch_in_place() {
        let (state, _tmp) = test_state(0);
        let router = app(state);
        let id = create_bucket(&router, "patch").await;
        stream_upload(&router, &id, "patch-test.txt", b"Hello, World!".to_vec()).await;

        let (status, body, _) = send(
            &router,
            HttpRequest::builder()
                .method("PATCH")
                .uri(format!("/api/buckets/{id}/files/patch-test.txt/content"))
                .header("authorization", format!("Bearer {ADMIN_KEY}"))
                .header("content-range", "bytes 7-11/*")
                .body(Body::from("Earth"))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["size"], 13);

        let (_, content, _) = send(
            &router,
            HttpRequest::builder()
                .uri(format!("/api/buckets/{id}/files/patch-test.txt/content"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(content, b"Hello, Earth!");
    }

    #[tokio::test]
    async fn test_patch_append() {
        let (state, _tmp) = test_state(0);
        let router = app(state);
        let id = create_bucket(&router, "patch").await;
        stream_upload(&router, &id, "grow.txt", b"Hello".to_vec()).await;

        let (status, body, _) = send(
            &router,
            HttpRequest::builder()
                .method("PATCH")
                .uri(format!("/api/buckets/{id}/files/grow.txt/content"))
                .header("authorization", format!("Bearer {ADMIN_KEY}"))
                .header("x-append", "true")
                .body(Body::from(", World!"))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["size"], 13);

        let (_, content, _) = send(
            &router,
            HttpRequest::builder()
                .uri(format!("/api/buckets/{id}/files/grow.txt/content"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(content, b"Hello, World!");
    }

    #[tokio::test]
    async fn test_patch_requires_mode_and_bounds() {
        let (state, _tmp) = test_state(0);
        let router = app(state);
        let id = create_bucket(&router, "patch").await;
        stream_upload(&router, &id, "f.txt", b"abc".to_vec()).await;

        // Neither Content-Range nor X-Append.
        let (status, _, _) = send(
            &router,
            HttpRequest::builder()
                .method("PATCH")
                .uri(format!("/api/buckets/{id}/files/f.txt/content"))
                .header("authorization", format!("Bearer {ADMIN_KEY}"))
                .body(Body::from("x"))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Start beyond the current size.
        let (status, _, _) = send(
            &router,
            HttpRequest::builder()
                .method("PATCH")
                .uri(format!("/api/buckets/{id}/files/f.txt/content"))
                .header("authorization", format!("Bearer {ADMIN_KEY}"))
                .header("content-range", "bytes 10-12/*")
                .body(Body::from("x"))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);

        // Missing file.
        let (status, _, _) = send(
            &router,
            HttpRequest::builder()
                .method("PATCH")
                .uri(format!("/api/buckets/{id}/files/ghost.txt/content"))
                .header("authorization", format!("Bearer {ADMIN_KEY}"))
                .header("x-append", "true")
                .body(Body::from("x"))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    // -- Delete ---------------------------------------------------------------

    #[tokio::test]
    async fn test_delete_file_and_counters() {
        let (state, _tmp) = test_state(0);
        let router = app(state);
        let id = create_bucket(&router, "del").await;
        stream_upload(&router, &id, "a.txt", b"12345".to_vec()).await;

        let (status, _, _) = send(
            &router,
            admin_req("DELETE", &format!("/api/buckets/{id}/files/a.txt"), Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, body, _) = send(
            &router,
            HttpRequest::builder()
                .uri(format!("/api/buckets/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["file_count"], 0);
        assert_eq!(json["total_size"], 0);

        // Deleting again is a clean 404 with no side effects.
        let (status, _, _) = send(
            &router,
            admin_req("DELETE", &format!("/api/buckets/{id}/files/a.txt"), Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    // -- Short URLs -----------------------------------------------------------

    #[tokio::test]
    async fn test_short_url_redirect_and_delete() {
        let (state, _tmp) = test_state(0);
        let router = app(state);
        let id = create_bucket(&router, "short").await;
        let view = stream_upload(&router, &id, "linked.txt", b"data".to_vec()).await;
        let code = view["short_code"].as_str().unwrap().to_string();

        let (status, _, headers) = send(
            &router,
            HttpRequest::builder()
                .uri(format!("/s/{code}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::FOUND);
        assert_eq!(
            headers.get("location").unwrap(),
            &format!("/api/buckets/{id}/files/linked.txt/content")
        );

        let (status, _, _) = send(
            &router,
            admin_req("DELETE", &format!("/api/short/{code}"), Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        // The code is gone; the file still exists.
        let (status, _, _) = send(
            &router,
            HttpRequest::builder()
                .uri(format!("/s/{code}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _, _) = send(
            &router,
            HttpRequest::builder()
                .uri(format!("/api/buckets/{id}/files/linked.txt"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    // -- Upload tokens --------------------------------------------------------

    #[tokio::test]
    async fn test_upload_token_consumption() {
        let (state, _tmp) = test_state(0);
        let router = app(state);
        let id = create_bucket(&router, "tokens").await;

        let (status, body, _) = send(
            &router,
            admin_req(
                "POST",
                &format!("/api/buckets/{id}/tokens"),
                Body::from("{\"max_uploads\": 1}"),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let token = json["token"].as_str().unwrap().to_string();
        assert!(token.starts_with("cfu_"));

        // First upload with the token succeeds.
        let (status, _, _) = send(
            &router,
            HttpRequest::builder()
                .method("PUT")
                .uri(format!(
                    "/api/buckets/{id}/upload/stream?filename=one.txt&token={token}"
                ))
                .body(Body::from("one"))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        // The slot is spent; the second upload is refused.
        let (status, _, _) = send(
            &router,
            HttpRequest::builder()
                .method("PUT")
                .uri(format!(
                    "/api/buckets/{id}/upload/stream?filename=two.txt&token={token}"
                ))
                .body(Body::from("two"))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_upload_token_wrong_bucket_is_refused() {
        let (state, _tmp) = test_state(0);
        let router = app(state);
        let id_a = create_bucket(&router, "a").await;
        let id_b = create_bucket(&router, "b").await;

        let (_, body, _) = send(
            &router,
            admin_req("POST", &format!("/api/buckets/{id_a}/tokens"), Body::from("{}")),
        )
        .await;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let token = json["token"].as_str().unwrap().to_string();

        let (status, _, _) = send(
            &router,
            HttpRequest::builder()
                .method("PUT")
                .uri(format!(
                    "/api/buckets/{id_b}/upload/stream?filename=f.txt&token={token}"
                ))
                .body(Body::from("x"))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    // -- Dashboard credentials ------------------------------------------------

    #[tokio::test]
    async fn test_dashboard_token_flow() {
        let (state, _tmp) = test_state(0);
        let router = app(state);

        let (status, body, _) = send(
            &router,
            admin_req("POST", "/api/tokens/dashboard", Body::from("{}")),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let token = json["token"].as_str().unwrap().to_string();
        assert_eq!(json["scope"], "admin");

        // The credential introspects.
        let (status, body, _) = send(
            &router,
            HttpRequest::builder()
                .uri("/api/tokens/dashboard/me")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["scope"], "admin");
        assert!(json["remaining_seconds"].as_i64().unwrap() > 0);

        // And acts as an admin credential elsewhere.
        let (status, _, _) = send(
            &router,
            HttpRequest::builder()
                .uri("/api/stats")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_dashboard_token_cap_and_401() {
        let (state, _tmp) = test_state(0);
        let router = app(state);

        // Expiry above 24h is refused at issuance.
        let (status, _, _) = send(
            &router,
            admin_req(
                "POST",
                "/api/tokens/dashboard",
                Body::from("{\"expires_in\": \"3d\"}"),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // /me without a credential is the one 401 in the API.
        let (status, _, _) = send(
            &router,
            HttpRequest::builder()
                .uri("/api/tokens/dashboard/me")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    // -- Stats and keys -------------------------------------------------------

    #[tokio::test]
    async fn test_stats_totals() {
        let (state, _tmp) = test_state(0);
        let router = app(state);
        let id = create_bucket(&router, "stats").await;
        stream_upload(&router, &id, "x.bin", vec![0u8; 128]).await;

        let (status, body, _) = send(&router, admin_req("GET", "/api/stats", Body::empty())).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["total_buckets"], 1);
        assert_eq!(json["total_files"], 1);
        assert_eq!(json["total_size"], 128);
        assert_eq!(json["storage_by_owner"][0]["owner"], "admin");

        // Public callers are refused.
        let (status, _, _) = send(
            &router,
            HttpRequest::builder()
                .uri("/api/stats")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_key_lifecycle_preserves_buckets() {
        let (state, _tmp) = test_state(0);
        let router = app(state);

        let key = create_api_key(&router, "tenant").await;
        let prefix = &key[..12];

        let (status, _, _) = send(
            &router,
            HttpRequest::builder()
                .method("POST")
                .uri("/api/buckets")
                .header("authorization", format!("Bearer {key}"))
                .header("content-type", "application/json")
                .body(Body::from("{\"name\": \"kept\"}"))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body, _) = send(
            &router,
            admin_req("GET", &format!("/api/keys/{prefix}/usage"), Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["bucket_count"], 1);

        let (status, _, _) = send(
            &router,
            admin_req("DELETE", &format!("/api/keys/{prefix}"), Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        // The key is dead, its buckets remain.
        let (_, body, _) = send(&router, admin_req("GET", "/api/buckets", Body::empty())).await;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["total"], 1);
    }

    // -- ZIP ------------------------------------------------------------------

    #[tokio::test]
    async fn test_zip_roundtrip() {
        let (state, _tmp) = test_state(0);
        let router = app(state);
        let id = create_bucket(&router, "archive").await;
        stream_upload(&router, &id, "a.txt", b"alpha".to_vec()).await;
        stream_upload(&router, &id, "nested/b.txt", b"beta".to_vec()).await;

        let (status, body, headers) = send(
            &router,
            HttpRequest::builder()
                .uri(format!("/api/buckets/{id}/zip"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("content-type").unwrap(), "application/zip");

        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(body)).unwrap();
        assert_eq!(archive.len(), 2);

        let mut names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.txt", "nested/b.txt"]);

        let mut contents = String::new();
        archive
            .by_name("a.txt")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "alpha");

        // HEAD sets the same headers without a body.
        let (status, body, headers) = send(
            &router,
            HttpRequest::builder()
                .method("HEAD")
                .uri(format!("/api/buckets/{id}/zip"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
        assert_eq!(headers.get("content-type").unwrap(), "application/zip");
    }

    // -- Summary --------------------------------------------------------------

    #[tokio::test]
    async fn test_bucket_summary_is_plain_text() {
        let (state, _tmp) = test_state(0);
        let router = app(state);
        let id = create_bucket(&router, "report").await;
        stream_upload(&router, &id, "a.txt", vec![0u8; 2048]).await;

        let (status, body, headers) = send(
            &router,
            HttpRequest::builder()
                .uri(format!("/api/buckets/{id}/summary"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(headers
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("Bucket: report"));
        assert!(text.contains("Owner: admin"));
        assert!(text.contains("a.txt (2.0 KiB)"));
    }
}
