//! Per-client rate limiting middleware.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::warn;

use crate::ratelimit::{ClientKey, RateLimiter, Verdict};

/// Header carrying the configured limit.
pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
/// Header carrying the requests still admissible in the current window.
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";

/// State shared with [`rate_limit_middleware`].
#[derive(Clone)]
pub struct RateLimitState {
    limiter: Arc<RateLimiter>,
    trust_forwarded_for: bool,
}

impl RateLimitState {
    /// Wrap a shared limiter for use with `axum::middleware::from_fn_with_state`.
    ///
    /// With `trust_forwarded_for`, clients are keyed by the first
    /// `X-Forwarded-For` entry when present.
    pub fn new(limiter: Arc<RateLimiter>, trust_forwarded_for: bool) -> Self {
        Self {
            limiter,
            trust_forwarded_for,
        }
    }
}

/// Derive the client key for a request: the peer IP without its port, or the
/// first `X-Forwarded-For` entry when the proxy is trusted.
pub fn client_key(req: &Request, trust_forwarded_for: bool) -> Option<ClientKey> {
    if trust_forwarded_for {
        if let Some(ip) = forwarded_for(req.headers()) {
            return Some(ClientKey::from(ip));
        }
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ClientKey::from(ci.0.ip()))
}

fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}

/// Rate-limiting middleware. Checks the limiter once per request and returns
/// 429 when the client's limit is exhausted.
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    req: Request,
    next: Next,
) -> Response {
    let Some(key) = client_key(&req, state.trust_forwarded_for) else {
        warn!(uri = %req.uri(), "No client address on request, skipping rate limit");
        return next.run(req).await;
    };

    let verdict = state.limiter.allow(&key, Instant::now());
    if !verdict.admitted {
        return too_many_requests(&verdict);
    }

    let mut response = next.run(req).await;
    set_quota_headers(response.headers_mut(), &verdict);
    response
}

fn too_many_requests(verdict: &Verdict) -> Response {
    let retry_after = retry_after_secs(verdict.retry_after);
    let body = json!({
        "error": "rate limit exceeded",
        "retry_after_secs": retry_after,
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    set_quota_headers(headers, verdict);
    response
}

fn set_quota_headers(headers: &mut HeaderMap, verdict: &Verdict) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(verdict.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(verdict.remaining));
}

/// Whole seconds for a `Retry-After` header, rounded up and at least 1.
fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}
