//! Rate limiting middleware for axum.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, error, instrument, warn};

use super::classify::{classify, Identity, Unidentified};
use crate::ratelimit::{CountingKey, RateLimiter};

/// Body of every 429 response.
pub const RATE_LIMIT_MESSAGE: &str =
    "you have reached the maximum number of requests or actions allowed within a certain time frame";

const UNIDENTIFIED_MESSAGE: &str = "Unable to determine IP address";
const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

/// Admit or reject a request before it reaches the wrapped handler.
///
/// Install with [`axum::middleware::from_fn_with_state`]. The peer address is
/// read from [`ConnectInfo`] when the server provides it.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let identity = match classify(request.headers(), peer) {
        Ok(identity) => identity,
        Err(Unidentified) => {
            warn!("Rejecting request without a token or client address");
            return (StatusCode::BAD_REQUEST, UNIDENTIFIED_MESSAGE).into_response();
        }
    };

    let verdict = match &identity {
        Identity::Token(token) => limiter.allow_token(token).await,
        Identity::Ip(ip) => limiter.allow_ip(ip).await,
    };

    match verdict {
        Ok(true) => next.run(request).await,
        Ok(false) => {
            debug!(identity = %identity, "Request rate limited");
            too_many_requests(&limiter, &identity.key()).await
        }
        Err(e) => {
            error!(identity = %identity, error = %e, "Rate limit decision failed");
            (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_MESSAGE).into_response()
        }
    }
}

/// Build the 429 response, with `Retry-After` when the block TTL is known.
async fn too_many_requests(limiter: &RateLimiter, key: &CountingKey) -> Response {
    let mut response = (StatusCode::TOO_MANY_REQUESTS, RATE_LIMIT_MESSAGE).into_response();

    match limiter.remaining_block_duration(key).await {
        Ok(remaining) if !remaining.is_zero() => {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(remaining)));
        }
        Ok(_) => {}
        Err(e) => warn!(key = %key, error = %e, "Could not read block TTL for Retry-After"),
    }

    response
}

/// Whole seconds, rounded up so clients never retry early.
fn retry_after_secs(remaining: Duration) -> u64 {
    remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0)
}
