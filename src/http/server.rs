//! HTTP server implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::middleware::from_fn_with_state;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{rate_limit_middleware, RateLimitState};
use crate::error::{Result, TurnstileError};
use crate::ratelimit::RateLimiter;

/// HTTP server that puts a rate limiter in front of a host router.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter instance
    rate_limiter: Arc<RateLimiter>,
    /// Routes served behind the limiter
    router: Router,
    /// Key clients by `X-Forwarded-For`
    trust_forwarded_for: bool,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, rate_limiter: Arc<RateLimiter>, router: Router) -> Self {
        Self {
            addr,
            rate_limiter,
            router,
            trust_forwarded_for: false,
        }
    }

    /// Key clients by the first `X-Forwarded-For` entry when present.
    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    /// The host router wrapped in the rate limiting middleware.
    pub fn into_router(self) -> Router {
        let state = RateLimitState::new(self.rate_limiter, self.trust_forwarded_for);
        self.router
            .layer(from_fn_with_state(state, rate_limit_middleware))
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(
            addr = %listener.local_addr()?,
            trust_forwarded_for = self.trust_forwarded_for,
            "Starting HTTP server"
        );

        let app = self.into_router();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TurnstileError::Io(e)
        })
    }
}
