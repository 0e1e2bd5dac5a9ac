//! HTTP layer: request classification, rate limiting middleware and server.

mod classify;
mod middleware;
mod server;

pub use classify::{
    classify, client_ip, Identity, Unidentified, API_KEY_HEADER, FORWARDED_FOR_HEADER,
    REAL_IP_HEADER,
};
pub use middleware::{rate_limit, RATE_LIMIT_MESSAGE};
pub use server::HttpServer;
