//! HTTP front end: middleware that applies the rate limiter to every request.

mod middleware;
mod server;

pub use middleware::{
    client_key, rate_limit_middleware, RateLimitState, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING,
};
pub use server::HttpServer;

use axum::routing::get;
use axum::Router;

/// Minimal routes served by the standalone binary.
pub fn routes() -> Router {
    Router::new()
        .route("/", get(|| async { "ok" }))
        .route("/healthz", get(|| async { "ok" }))
}
