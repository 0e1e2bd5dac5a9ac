//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::rate_limit;
use crate::error::{Result, TollgateError};
use crate::ratelimit::RateLimiter;

/// HTTP server with rate limiting in front of its routes.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter instance
    rate_limiter: Arc<RateLimiter>,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, rate_limiter: Arc<RateLimiter>) -> Self {
        Self { addr, rate_limiter }
    }

    /// Build the application router.
    ///
    /// `/health` bypasses the limiter; every other route is rate limited.
    pub fn router(rate_limiter: Arc<RateLimiter>) -> Router {
        let limited = Router::new()
            .route("/", get(root))
            .layer(axum::middleware::from_fn_with_state(rate_limiter, rate_limit));

        Router::new().route("/health", get(health)).merge(limited)
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        let app = Self::router(self.rate_limiter);

        info!(addr = %self.addr, "Starting HTTP server");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TollgateError::Server(e.to_string())
        })
    }
}

async fn root() -> &'static str {
    "Request successful!"
}

async fn health() -> &'static str {
    "OK"
}
