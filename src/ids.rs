//! Identifier generation, MIME lookup, and expiry parsing.
//!
//! All generators draw from the process CSPRNG.  Credential formats:
//!
//! ```text
//! bucket id     XXXXXXXXXX                  10 chars [A-Za-z0-9]
//! short code    XXXXXX                       6 chars [A-Za-z0-9]
//! API key       cf4_{8 hex}_{32 hex}        prefix + secret
//! upload token  cfu_{48 hex}
//! ```

use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;

/// Length of a bucket identifier.
const BUCKET_ID_LEN: usize = 10;

/// Length of a short code.
const SHORT_CODE_LEN: usize = 6;

/// Generate a 10-character URL-safe alphanumeric bucket ID.
pub fn generate_bucket_id() -> String {
    random_alphanumeric(BUCKET_ID_LEN)
}

/// Generate a 6-character alphanumeric short code.
pub fn generate_short_code() -> String {
    random_alphanumeric(SHORT_CODE_LEN)
}

/// Generate an API key.
///
/// Returns `(full_key, prefix, secret)`: the full key is handed to the
/// caller exactly once, the prefix is the stored primary key, and the
/// secret is hashed before persistence.
pub fn generate_api_key() -> (String, String, String) {
    let prefix_bytes: [u8; 4] = rand::random();
    let secret_bytes: [u8; 16] = rand::random();
    let prefix = format!("cf4_{}", hex::encode(prefix_bytes));
    let secret = hex::encode(secret_bytes);
    let full = format!("{prefix}_{secret}");
    (full, prefix, secret)
}

/// Generate an upload token: `cfu_` followed by 48 lowercase hex chars.
pub fn generate_upload_token() -> String {
    let bytes: [u8; 24] = rand::random();
    format!("cfu_{}", hex::encode(bytes))
}

fn random_alphanumeric(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

// -- MIME lookup --------------------------------------------------------------

/// Extension to MIME type table, lowercased extensions.
const MIME_TYPES: &[(&str, &str)] = &[
    ("txt", "text/plain"),
    ("md", "text/markdown"),
    ("html", "text/html"),
    ("htm", "text/html"),
    ("css", "text/css"),
    ("csv", "text/csv"),
    ("js", "text/javascript"),
    ("mjs", "text/javascript"),
    ("json", "application/json"),
    ("xml", "application/xml"),
    ("yaml", "application/yaml"),
    ("yml", "application/yaml"),
    ("toml", "application/toml"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("gz", "application/gzip"),
    ("tar", "application/x-tar"),
    ("7z", "application/x-7z-compressed"),
    ("rar", "application/vnd.rar"),
    ("wasm", "application/wasm"),
    ("doc", "application/msword"),
    (
        "docx",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    ),
    ("xls", "application/vnd.ms-excel"),
    (
        "xlsx",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    ),
    ("ppt", "application/vnd.ms-powerpoint"),
    (
        "pptx",
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    ),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("svg", "image/svg+xml"),
    ("ico", "image/x-icon"),
    ("bmp", "image/bmp"),
    ("tif", "image/tiff"),
    ("tiff", "image/tiff"),
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("ogg", "audio/ogg"),
    ("flac", "audio/flac"),
    ("m4a", "audio/mp4"),
    ("mp4", "video/mp4"),
    ("webm", "video/webm"),
    ("mkv", "video/x-matroska"),
    ("avi", "video/x-msvideo"),
    ("mov", "video/quicktime"),
    ("woff", "font/woff"),
    ("woff2", "font/woff2"),
    ("ttf", "font/ttf"),
    ("otf", "font/otf"),
];

/// Look up the MIME type for a logical path by its extension.
///
/// Unknown or missing extensions map to `application/octet-stream`.
pub fn mime_type_for(path: &str) -> &'static str {
    let ext = match path.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() && !ext.contains('/') => ext.to_lowercase(),
        _ => return "application/octet-stream",
    };
    MIME_TYPES
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, mime)| *mime)
        .unwrap_or("application/octet-stream")
}

// -- Expiry parsing -----------------------------------------------------------

/// What kind of expiry is being parsed; selects the default duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryKind {
    /// Buckets default to one week.
    Bucket,
    /// Upload tokens default to one day.
    UploadToken,
    /// Dashboard credentials default to one hour, hard-capped at 24 hours.
    Dashboard,
}

impl ExpiryKind {
    fn default_duration(self) -> Duration {
        match self {
            ExpiryKind::Bucket => Duration::weeks(1),
            ExpiryKind::UploadToken => Duration::days(1),
            ExpiryKind::Dashboard => Duration::hours(1),
        }
    }
}

/// Named duration presets accepted by the expiry parser.
const EXPIRY_PRESETS: &[(&str, i64)] = &[
    ("15m", 15 * 60),
    ("1h", 3600),
    ("6h", 6 * 3600),
    ("12h", 12 * 3600),
    ("1d", 86400),
    ("3d", 3 * 86400),
    ("1w", 7 * 86400),
    ("2w", 14 * 86400),
    ("1m", 30 * 86400),
];

/// Parse an expiry specification into an absolute instant.
///
/// Accepted shapes:
/// - a numeric string: Unix seconds (UTC)
/// - a string containing `T`: RFC 3339 instant
/// - a preset: `15m 1h 6h 12h 1d 3d 1w 2w 1m`
/// - the literal `never`: no expiry
/// - `None` or empty: the kind's default duration from now
///
/// Dashboard expiries beyond 24 hours from now are rejected.
pub fn parse_expiry(
    input: Option<&str>,
    kind: ExpiryKind,
) -> Result<Option<DateTime<Utc>>, String> {
    let now = Utc::now();

    let expires_at = match input.map(str::trim).filter(|s| !s.is_empty()) {
        None => Some(now + kind.default_duration()),
        Some("never") => None,
        Some(s) if s.chars().all(|c| c.is_ascii_digit()) => {
            let secs: i64 = s.parse().map_err(|_| format!("invalid expiry: {s}"))?;
            let instant = Utc
                .timestamp_opt(secs, 0)
                .single()
                .ok_or_else(|| format!("invalid expiry timestamp: {s}"))?;
            Some(instant)
        }
        Some(s) if s.contains('T') => {
            let instant = DateTime::parse_from_rfc3339(s)
                .map_err(|_| format!("invalid expiry instant: {s}"))?;
            Some(instant.with_timezone(&Utc))
        }
        Some(s) => {
            let secs = EXPIRY_PRESETS
                .iter()
                .find(|(name, _)| *name == s)
                .map(|(_, secs)| *secs)
                .ok_or_else(|| format!("unknown expiry preset: {s}"))?;
            Some(now + Duration::seconds(secs))
        }
    };

    if kind == ExpiryKind::Dashboard {
        match expires_at {
            None => return Err("dashboard credentials cannot be unexpiring".to_string()),
            Some(at) if at > now + Duration::hours(24) => {
                return Err("dashboard credential expiry exceeds the 24 hour cap".to_string());
            }
            _ => {}
        }
    }

    Ok(expires_at)
}

// -- Tests --------------------------------------------------------------------
