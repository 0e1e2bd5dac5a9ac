//! Tollgate - HTTP admission control
//!
//! This crate decides, per inbound HTTP request, whether the request may
//! proceed. Requests are counted per API token or, without a token, per client
//! IP; a caller that exceeds its per-second limit is locked out for a
//! configured duration. Counters live in a pluggable store (Redis in
//! production, memory for tests and single-node use).

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod storage;
