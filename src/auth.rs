//! Credential resolution.
//!
//! Maps a bearer credential to one of `{Admin, Owner, Public}`:
//!
//! 1. Empty → Public.
//! 2. Constant-time compare against the configured admin key → Admin.
//! 3. `cf4_` prefix → API-key lookup by prefix, SHA-256 compare of the
//!    secret portion, `last_used_at` touch, 30-second cache → Owner.
//!    A miss is Public, never a 401 — the route's own authorization
//!    check decides.
//! 4. Otherwise a dashboard credential (HS256 JWT with `scope`/`exp`
//!    claims) → Admin when valid, Public when not.
//!
//! Upload tokens are not resolved here; the upload handlers validate
//! them per request.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::AppState;

/// How long a verified API key stays cached.
const CREDENTIAL_CACHE_TTL: Duration = Duration::from_secs(30);

/// The resolved identity of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthContext {
    /// Holder of the admin key or a valid dashboard credential.
    Admin,
    /// Holder of a valid API key.
    Owner { name: String, key_prefix: String },
    /// No credential, or one that did not verify.
    Public,
}

impl AuthContext {
    pub fn is_admin(&self) -> bool {
        matches!(self, AuthContext::Admin)
    }

    pub fn is_public(&self) -> bool {
        matches!(self, AuthContext::Public)
    }

    /// Whether this identity may mutate a bucket owned by `bucket_owner`.
    pub fn can_manage(&self, bucket_owner: &str) -> bool {
        match self {
            AuthContext::Admin => true,
            AuthContext::Owner { name, .. } => name == bucket_owner,
            AuthContext::Public => false,
        }
    }

    /// The owner display name recorded on buckets this identity creates.
    pub fn owner_name(&self) -> &str {
        match self {
            AuthContext::Owner { name, .. } => name,
            _ => "admin",
        }
    }

    /// The API-key prefix, when the identity is key-backed.
    pub fn key_prefix(&self) -> Option<&str> {
        match self {
            AuthContext::Owner { key_prefix, .. } => Some(key_prefix),
            _ => None,
        }
    }
}

/// Compare two strings in constant time.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Hex SHA-256 digest of an API-key secret.
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Split a full API key `cf4_{8 hex}_{32 hex}` into `(prefix, secret)`.
pub fn parse_api_key(key: &str) -> Option<(&str, &str)> {
    // cf4_ + 8 + _ + 32
    if key.len() != 45 || !key.starts_with("cf4_") {
        return None;
    }
    let prefix = &key[..12];
    if key.as_bytes()[12] != b'_' {
        return None;
    }
    let secret = &key[13..];
    let hexish = |s: &str| s.chars().all(|c| c.is_ascii_hexdigit());
    if !hexish(&prefix[4..]) || !hexish(secret) {
        return None;
    }
    Some((prefix, secret))
}

// -- Credential cache ---------------------------------------------------------

struct CachedOwner {
    name: String,
    key_prefix: String,
    deadline: Instant,
}

/// Short-lived cache of verified API keys, keyed by the full key string.
#[derive(Default)]
pub struct AuthCache {
    entries: Mutex<HashMap<String, CachedOwner>>,
}

impl AuthCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, full_key: &str) -> Option<(String, String)> {
        let mut entries = self.entries.lock().expect("mutex poisoned");
        match entries.get(full_key) {
            Some(entry) if entry.deadline > Instant::now() => {
                Some((entry.name.clone(), entry.key_prefix.clone()))
            }
            Some(_) => {
                entries.remove(full_key);
                None
            }
            None => None,
        }
    }

    fn put(&self, full_key: &str, name: String, key_prefix: String) {
        let mut entries = self.entries.lock().expect("mutex poisoned");
        entries.insert(
            full_key.to_string(),
            CachedOwner {
                name,
                key_prefix,
                deadline: Instant::now() + CREDENTIAL_CACHE_TTL,
            },
        );
    }
}

// -- Dashboard credentials ----------------------------------------------------

/// Claims carried by a dashboard credential.
#[derive(Debug, Serialize, Deserialize)]
pub struct DashboardClaims {
    pub scope: String,
    pub exp: i64,
}

/// Sign a dashboard credential expiring at `expires_at`.
pub fn issue_dashboard_credential(
    secret: &str,
    expires_at: chrono::DateTime<chrono::Utc>,
) -> anyhow::Result<String> {
    let claims = DashboardClaims {
        scope: "admin".to_string(),
        exp: expires_at.timestamp(),
    };
    let token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok(token)
}

/// Verify a dashboard credential: signature, expiry, and admin scope.
///
/// Expiry is always enforced here regardless of the issuance cap, since
/// clocks drift and callers may pre-issue.
pub fn validate_dashboard_credential(secret: &str, token: &str) -> Option<DashboardClaims> {
    let validation = Validation::new(Algorithm::HS256);
    let data = decode::<DashboardClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .ok()?;
    if data.claims.scope != "admin" {
        return None;
    }
    Some(data.claims)
}

// -- Resolution ---------------------------------------------------------------

/// Resolve a bearer credential into an [`AuthContext`].
pub async fn resolve(state: &AppState, bearer: Option<&str>) -> anyhow::Result<AuthContext> {
    let Some(token) = bearer.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(AuthContext::Public);
    };

    if constant_time_eq(token, &state.config.auth.admin_key) {
        return Ok(AuthContext::Admin);
    }

    if token.starts_with("cf4_") {
        if let Some((name, key_prefix)) = state.auth_cache.get(token) {
            return Ok(AuthContext::Owner { name, key_prefix });
        }

        if let Some((prefix, secret)) = parse_api_key(token) {
            if let Some(key) = state.metadata.get_api_key(prefix).await? {
                if constant_time_eq(&hash_secret(secret), &key.hashed_secret) {
                    if let Err(e) = state.metadata.touch_api_key(prefix).await {
                        tracing::warn!(prefix, error = %e, "failed to stamp api key usage");
                    }
                    state
                        .auth_cache
                        .put(token, key.name.clone(), prefix.to_string());
                    return Ok(AuthContext::Owner {
                        name: key.name,
                        key_prefix: prefix.to_string(),
                    });
                }
            }
        }
        return Ok(AuthContext::Public);
    }

    if validate_dashboard_credential(state.config.auth.signing_secret(), token).is_some() {
        return Ok(AuthContext::Admin);
    }

    Ok(AuthContext::Public)
}

// -- Tests --------------------------------------------------------------------
