//! Authentication collaborator boundary.
//!
//! The daemon never checks credentials; it exchanges an opaque token for an
//! `Identity {user_id, role}` through [`TokenVerifier`]. The production
//! verifier accepts compact HMAC-SHA256 tokens
//! (`base64url(claims).base64url(mac)`) minted by the identity service with
//! the shared secret; scenario tests use [`StaticTokenVerifier`].
//!
//! Token values are never logged.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use sovd_schemas::{Identity, UserRole};

use crate::error::{ApiError, RequestContext};
use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// AuthError / TokenVerifier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    Invalid,
    Expired,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::Invalid => write!(f, "token is invalid"),
            AuthError::Expired => write!(f, "token is expired"),
        }
    }
}

impl std::error::Error for AuthError {}

pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

// ---------------------------------------------------------------------------
// HmacTokenVerifier
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// Subject user id.
    sub: Uuid,
    role: UserRole,
    /// Expiry, epoch seconds. Absent = non-expiring (dev tokens).
    #[serde(skip_serializing_if = "Option::is_none")]
    exp: Option<i64>,
}

/// Verifies (and, for dev/test wiring, mints) compact HMAC-SHA256 tokens.
pub struct HmacTokenVerifier {
    key: Vec<u8>,
}

impl HmacTokenVerifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            key: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self, payload: &[u8]) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(payload);
        mac
    }

    /// Mint a token for `identity`, valid for `ttl` (or non-expiring).
    pub fn issue(&self, identity: Identity, ttl: Option<Duration>) -> String {
        let claims = Claims {
            sub: identity.user_id,
            role: identity.role,
            exp: ttl.map(|d| Utc::now().timestamp() + d.as_secs() as i64),
        };
        let payload = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&claims).expect("claims serialization cannot fail"),
        );
        let tag = self.mac(payload.as_bytes()).finalize().into_bytes();
        format!("{payload}.{}", URL_SAFE_NO_PAD.encode(tag))
    }
}

impl TokenVerifier for HmacTokenVerifier {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let (payload, tag_b64) = token.split_once('.').ok_or(AuthError::Invalid)?;
        let tag = URL_SAFE_NO_PAD
            .decode(tag_b64)
            .map_err(|_| AuthError::Invalid)?;

        // Constant-time comparison through the Mac verifier.
        self.mac(payload.as_bytes())
            .verify_slice(&tag)
            .map_err(|_| AuthError::Invalid)?;

        let claims: Claims = serde_json::from_slice(
            &URL_SAFE_NO_PAD
                .decode(payload)
                .map_err(|_| AuthError::Invalid)?,
        )
        .map_err(|_| AuthError::Invalid)?;

        if let Some(exp) = claims.exp {
            if exp <= Utc::now().timestamp() {
                return Err(AuthError::Expired);
            }
        }

        Ok(Identity {
            user_id: claims.sub,
            role: claims.role,
        })
    }
}

// ---------------------------------------------------------------------------
// StaticTokenVerifier — scenario-test collaborator
// ---------------------------------------------------------------------------

/// Maps fixed token strings to identities. Deterministic stand-in for the
/// identity service in scenario tests.
#[derive(Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        self.tokens.get(token).copied().ok_or(AuthError::Invalid)
    }
}

// ---------------------------------------------------------------------------
// Caller extractor
// ---------------------------------------------------------------------------

/// Resolved caller identity for REST handlers, extracted from
/// `Authorization: Bearer <token>`.
pub struct Caller(pub Identity);

pub fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

#[async_trait::async_trait]
impl FromRequestParts<Arc<AppState>> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let ctx = parts
            .extensions
            .get::<RequestContext>()
            .cloned()
            .unwrap_or_default();

        let token = bearer_token(parts).ok_or_else(|| ApiError::unauthenticated(&ctx))?;
        match state.verifier.verify(token) {
            Ok(identity) => Ok(Caller(identity)),
            Err(err) => {
                debug!(%err, "token verification failed");
                Err(ApiError::unauthenticated(&ctx))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
