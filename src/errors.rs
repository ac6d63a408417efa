//! API error types.
//!
//! Every variant maps to one HTTP status from the service's error
//! taxonomy.  The enum implements [`axum::response::IntoResponse`] so
//! handlers can simply return `Err(ApiError::NotFound { .. })`; the JSON
//! body is `{"error": ..., "hint": ...}` with `hint` omitted when absent.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Service failures, translated exactly once at the HTTP boundary.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Empty or malformed input (name, expiry, range header, content range).
    #[error("{message}")]
    Validation { message: String },

    /// Missing credential on an endpoint that requires one.
    #[error("Missing credential")]
    Unauthorized,

    /// The resolved role is insufficient for this operation.
    #[error("{message}")]
    Forbidden { message: String },

    /// Bucket, file, key, token, or short code not found, or bucket expired.
    #[error("{resource} not found")]
    NotFound { resource: String },

    /// Short-code collision after retry exhaustion.
    #[error("{message}")]
    Conflict { message: String },

    /// Request body above the configured maximum upload size.
    #[error("Request body exceeds the maximum upload size")]
    PayloadTooLarge,

    /// Invalid or beyond-size byte range (GET or PATCH).
    #[error("The requested range is not satisfiable")]
    RangeNotSatisfiable { total: Option<u64> },

    /// Metadata store unreachable.
    #[error("Metadata store unavailable")]
    StoreUnavailable,

    /// Catch-all for unexpected internal errors.
    #[error("Internal error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Convenience constructor for 403 responses.
    pub fn forbidden(message: impl Into<String>) -> Self {
        ApiError::Forbidden {
            message: message.into(),
        }
    }

    /// Convenience constructor for 400 responses.
    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::Validation {
            message: message.into(),
        }
    }

    /// Convenience constructor for 404 responses.
    pub fn not_found(resource: impl Into<String>) -> Self {
        ApiError::NotFound {
            resource: resource.into(),
        }
    }

    /// Return the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation { .. } => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden { .. } => StatusCode::FORBIDDEN,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            ApiError::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Optional human hint rendered beside the error message.
    fn hint(&self) -> Option<&'static str> {
        match self {
            ApiError::PayloadTooLarge => {
                Some("reduce the request body or raise server.max_upload_size")
            }
            ApiError::RangeNotSatisfiable { .. } => {
                Some("the requested byte range lies outside the stored file")
            }
            ApiError::Unauthorized => Some("pass a credential via the Authorization header"),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if let ApiError::Internal(e) = &self {
            tracing::error!(error = %e, "internal error");
        }

        let mut body = serde_json::json!({ "error": self.to_string() });
        if let Some(hint) = self.hint() {
            body["hint"] = serde_json::Value::String(hint.to_string());
        }

        let mut response = (status, Json(body)).into_response();

        // 416 advertises the actual entity length per RFC 7233.
        if let ApiError::RangeNotSatisfiable { total: Some(total) } = self {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{total}")) {
                response.headers_mut().insert("content-range", value);
            }
        }

        response
    }
}

// -- Tests -------------------------------------------------------------------
