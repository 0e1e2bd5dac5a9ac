//! Counting and blocking storage used by the rate limiter.
//!
//! Every backing store implements [`Storage`]. The engine never reads a
//! counter and writes it back; all counting goes through the atomic
//! [`Storage::increment`] operation, so any number of concurrent requests can
//! share a store without further synchronization.

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::InMemoryStorage;
pub use self::redis::{RedisSettings, RedisStorage};

/// Errors returned by storage implementations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The Redis server rejected a command or could not be reached.
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// The store could not be reached in time.
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    /// The caller's deadline passed before the operation completed.
    #[error("storage operation deadline exceeded")]
    DeadlineExceeded,

    /// The store was closed and no longer accepts operations.
    #[error("storage is closed")]
    Closed,
}

/// Trait for rate limit storage implementations.
///
/// Keys are opaque strings; the engine namespaces them before they reach the
/// store. All operations must be safe to call concurrently against the same key.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Increment the counter for `key` and (re)set its expiration.
    ///
    /// Creates the counter at 1 if it does not exist. The increment and the
    /// expiration are applied as one indivisible step. Returns the value after
    /// the increment.
    async fn increment(&self, key: &str, expiration: Duration) -> Result<u64, StorageError>;

    /// Current counter value, or zero if absent or expired.
    async fn get(&self, key: &str) -> Result<u64, StorageError>;

    /// Mark `key` as blocked for `duration`. Re-blocking resets the duration.
    async fn set_block(&self, key: &str, duration: Duration) -> Result<(), StorageError>;

    /// Whether `key` is currently blocked. Expired blocks read as not blocked.
    async fn is_blocked(&self, key: &str) -> Result<bool, StorageError>;

    /// Remaining block duration for `key`, zero if not blocked.
    async fn ttl(&self, key: &str) -> Result<Duration, StorageError>;

    /// Release any resources held by the store.
    async fn close(&self) -> Result<(), StorageError>;
}
