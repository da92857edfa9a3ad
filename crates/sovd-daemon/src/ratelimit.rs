//! Rate-limit collaborator boundary.
//!
//! The daemon owns only the enforcement seam: a middleware that consults a
//! [`RateLimiter`], exempts admins, and surfaces `429 RATE_001` with the
//! standard headers. Windowing policy lives behind the trait; the default
//! wiring is a per-user fixed window with an anonymous fallback key.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::error::{codes, ApiError, RequestContext};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub retry_after: Duration,
}

pub trait RateLimiter: Send + Sync {
    fn check(&self, key: &str) -> RateDecision;
}

/// Pass-through limiter; scenario tests and dev mode run with this.
pub struct UnlimitedLimiter;

impl RateLimiter for UnlimitedLimiter {
    fn check(&self, _key: &str) -> RateDecision {
        RateDecision {
            allowed: true,
            limit: u32::MAX,
            remaining: u32::MAX,
            retry_after: Duration::ZERO,
        }
    }
}

struct Window {
    started: Instant,
    count: u32,
}

/// In-memory fixed-window limiter, one window per key.
pub struct FixedWindowLimiter {
    limit: u32,
    window: Duration,
    windows: DashMap<String, Window>,
}

impl FixedWindowLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: DashMap::new(),
        }
    }
}

impl RateLimiter for FixedWindowLimiter {
    fn check(&self, key: &str) -> RateDecision {
        let now = Instant::now();
        let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.count = 0;
        }

        if entry.count >= self.limit {
            let elapsed = now.duration_since(entry.started);
            return RateDecision {
                allowed: false,
                limit: self.limit,
                remaining: 0,
                retry_after: self.window.saturating_sub(elapsed),
            };
        }

        entry.count += 1;
        RateDecision {
            allowed: true,
            limit: self.limit,
            remaining: self.limit - entry.count,
            retry_after: Duration::ZERO,
        }
    }
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Key selection: authenticated requests are keyed by user id (admins are
/// exempt entirely); everything else falls back to the peer address, or a
/// shared anonymous bucket when none is known (in-process tests).
pub async fn enforce(State(st): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let ctx = req
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_default();

    let identity = request_token(&req).and_then(|t| st.verifier.verify(t).ok());
    if identity.is_some_and(|id| id.role.is_admin()) {
        return next.run(req).await;
    }

    let key = match identity {
        Some(id) => format!("user:{}", id.user_id),
        None => match req.extensions().get::<ConnectInfo<SocketAddr>>() {
            Some(ConnectInfo(addr)) => format!("ip:{}", addr.ip()),
            None => "anon".to_string(),
        },
    };

    let decision = st.limiter.check(&key);
    if !decision.allowed {
        warn!(retry_after_secs = decision.retry_after.as_secs(), "rate limit exceeded");
        let mut resp = ApiError::new(
            &ctx,
            StatusCode::TOO_MANY_REQUESTS,
            codes::RATE_LIMITED,
            "rate limit exceeded",
        )
        .into_response();
        set_rate_headers(&mut resp, &decision);
        resp.headers_mut().insert(
            "Retry-After",
            header_num(decision.retry_after.as_secs().max(1)),
        );
        return resp;
    }

    let mut resp = next.run(req).await;
    set_rate_headers(&mut resp, &decision);
    resp
}

/// Bearer header, with the `token` query parameter as the WebSocket-upgrade
/// fallback (browsers cannot set headers on upgrade requests).
fn request_token(req: &Request) -> Option<&str> {
    if let Some(token) = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(token);
    }
    req.uri().query()?.split('&').find_map(|pair| {
        pair.strip_prefix("token=")
    })
}

fn set_rate_headers(resp: &mut Response, decision: &RateDecision) {
    if decision.limit == u32::MAX {
        return;
    }
    resp.headers_mut()
        .insert("X-RateLimit-Limit", header_num(decision.limit as u64));
    resp.headers_mut()
        .insert("X-RateLimit-Remaining", header_num(decision.remaining as u64));
}

fn header_num(n: u64) -> HeaderValue {
    HeaderValue::from_str(&n.to_string()).expect("numeric header value")
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
