//! Core rate limiter implementation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, trace};

use super::key::CountingKey;
use super::policy::Policy;
use crate::error::{Result, TollgateError};
use crate::storage::{Storage, StorageError};

/// Length of the counting window. Every hit pushes the counter's expiration
/// this far into the future.
pub const WINDOW: Duration = Duration::from_secs(1);

/// The rate decision engine.
///
/// Holds an immutable [`Policy`] and a handle to the backing store. All
/// mutable state lives in the store, so a single `RateLimiter` can be shared
/// across any number of tasks.
pub struct RateLimiter {
    storage: Arc<dyn Storage>,
    policy: Policy,
    /// Deadline applied to every decision when the caller provides none
    operation_timeout: Option<Duration>,
}

impl RateLimiter {
    /// Create a new rate limiter over `storage` enforcing `policy`.
    pub fn new(storage: Arc<dyn Storage>, policy: Policy) -> Self {
        Self {
            storage,
            policy,
            operation_timeout: None,
        }
    }

    /// Bound every decision by `timeout` unless the caller supplies an
    /// earlier deadline.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// The policy this limiter enforces.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// The backing store.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Check whether a request from `ip` is allowed.
    pub async fn allow_ip(&self, ip: &str) -> Result<bool> {
        self.allow(&CountingKey::ip(ip), None).await
    }

    /// Check whether a request carrying `token` is allowed.
    ///
    /// Tokens without an override are governed by the default token rule.
    pub async fn allow_token(&self, token: &str) -> Result<bool> {
        self.allow(&CountingKey::token(token), None).await
    }

    /// Like [`RateLimiter::allow_ip`], failing with a storage error if the
    /// decision is not reached by `deadline`.
    pub async fn allow_ip_until(&self, ip: &str, deadline: Instant) -> Result<bool> {
        self.allow(&CountingKey::ip(ip), Some(deadline)).await
    }

    /// Like [`RateLimiter::allow_token`], failing with a storage error if the
    /// decision is not reached by `deadline`.
    pub async fn allow_token_until(&self, token: &str, deadline: Instant) -> Result<bool> {
        self.allow(&CountingKey::token(token), Some(deadline)).await
    }

    /// Decide whether one more request for `key` is allowed.
    ///
    /// Returns `Ok(false)` for a denied request and `Err` when the store could
    /// not be consulted; an error never stands in for either verdict.
    pub async fn allow(&self, key: &CountingKey, deadline: Option<Instant>) -> Result<bool> {
        let deadline = self.effective_deadline(deadline);

        trace!(key = %key, "Checking rate limit");

        // A blocked key is denied without touching its counter.
        let blocked = self
            .bounded("check block", deadline, self.storage.is_blocked(key.as_str()))
            .await?;
        if blocked {
            trace!(key = %key, "Key is blocked");
            return Ok(false);
        }

        let rule = self.policy.rule_for(key.namespace(), key.identity());

        let count = self
            .bounded(
                "increment counter",
                deadline,
                self.storage.increment(key.as_str(), WINDOW),
            )
            .await?;

        if rule.is_exceeded_by(count) {
            self.bounded(
                "set block",
                deadline,
                self.storage.set_block(key.as_str(), rule.block_duration),
            )
            .await?;

            debug!(
                key = %key,
                count = count,
                limit = rule.limit,
                block_duration = ?rule.block_duration,
                "Rate limit exceeded, key blocked"
            );
            return Ok(false);
        }

        Ok(true)
    }

    /// Remaining block duration for `key`, zero if it is not blocked.
    pub async fn remaining_block_duration(&self, key: &CountingKey) -> Result<Duration> {
        let deadline = self.effective_deadline(None);
        self.bounded("read block ttl", deadline, self.storage.ttl(key.as_str()))
            .await
    }

    /// Current request count for `key` in its window.
    pub async fn current_count(&self, key: &CountingKey) -> Result<u64> {
        let deadline = self.effective_deadline(None);
        self.bounded("read counter", deadline, self.storage.get(key.as_str()))
            .await
    }

    fn effective_deadline(&self, requested: Option<Instant>) -> Option<Instant> {
        let configured = self.operation_timeout.map(|timeout| Instant::now() + timeout);
        match (requested, configured) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Run one storage step under the decision deadline.
    async fn bounded<T, F>(
        &self,
        operation: &'static str,
        deadline: Option<Instant>,
        step: F,
    ) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, StorageError>>,
    {
        let outcome = match deadline {
            Some(deadline) if Instant::now() >= deadline => Err(StorageError::DeadlineExceeded),
            Some(deadline) => tokio::time::timeout_at(deadline, step)
                .await
                .unwrap_or(Err(StorageError::DeadlineExceeded)),
            None => step.await,
        };

        outcome.map_err(|source| {
            error!(operation = operation, error = %source, "Storage operation failed");
            TollgateError::storage(operation, source)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::LimitRule;
    use crate::storage::InMemoryStorage;
    use async_trait::async_trait;
    use tokio_test::assert_err;

    fn create_test_limiter(storage: Arc<InMemoryStorage>) -> RateLimiter {
        let policy = Policy::new(
            LimitRule::new(5, Duration::from_secs(30)),
            LimitRule::new(10, Duration::from_secs(5)),
        )
        .with_token_override("premium", LimitRule::new(20, Duration::from_secs(10)));
        RateLimiter::new(storage, policy)
    }

    /// Storage whose operations never finish in time.
    struct StalledStorage;

    #[async_trait]
    impl Storage for StalledStorage {
        async fn increment(&self, _: &str, _: Duration) -> std::result::Result<u64, StorageError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(1)
        }
        async fn get(&self, _: &str) -> std::result::Result<u64, StorageError> {
            Ok(0)
        }
        async fn set_block(&self, _: &str, _: Duration) -> std::result::Result<(), StorageError> {
            Ok(())
        }
        async fn is_blocked(&self, _: &str) -> std::result::Result<bool, StorageError> {
            Ok(false)
        }
        async fn ttl(&self, _: &str) -> std::result::Result<Duration, StorageError> {
            Ok(Duration::ZERO)
        }
        async fn close(&self) -> std::result::Result<(), StorageError> {
            Ok(())
        }
    }

    /// Storage that counts normally but cannot record a block.
    struct UnblockableStorage {
        inner: InMemoryStorage,
    }

    #[async_trait]
    impl Storage for UnblockableStorage {
        async fn increment(
            &self,
            key: &str,
            window: Duration,
        ) -> std::result::Result<u64, StorageError> {
            self.inner.increment(key, window).await
        }
        async fn get(&self, key: &str) -> std::result::Result<u64, StorageError> {
            self.inner.get(key).await
        }
        async fn set_block(&self, _: &str, _: Duration) -> std::result::Result<(), StorageError> {
            Err(StorageError::Unavailable("write rejected".to_string()))
        }
        async fn is_blocked(&self, key: &str) -> std::result::Result<bool, StorageError> {
            self.inner.is_blocked(key).await
        }
        async fn ttl(&self, key: &str) -> std::result::Result<Duration, StorageError> {
            self.inner.ttl(key).await
        }
        async fn close(&self) -> std::result::Result<(), StorageError> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_ip_within_limit_allowed() {
        let limiter = create_test_limiter(Arc::new(InMemoryStorage::new()));

        for i in 1..=5 {
            assert!(limiter.allow_ip("192.168.1.1").await.unwrap(), "request {i}");
        }
    }

    #[tokio::test]
    async fn test_ip_over_limit_blocked() {
        let limiter = create_test_limiter(Arc::new(InMemoryStorage::new()));

        for _ in 0..5 {
            limiter.allow_ip("203.0.113.9").await.unwrap();
        }

        assert!(!limiter.allow_ip("203.0.113.9").await.unwrap());
        assert!(!limiter.allow_ip("203.0.113.9").await.unwrap());

        let ttl = limiter
            .remaining_block_duration(&CountingKey::ip("203.0.113.9"))
            .await
            .unwrap();
        assert!(ttl > Duration::ZERO && ttl <= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_blocked_requests_do_not_count() {
        let storage = Arc::new(InMemoryStorage::new());
        let limiter = create_test_limiter(storage.clone());
        let key = CountingKey::ip("10.0.0.1");

        for _ in 0..10 {
            limiter.allow_ip("10.0.0.1").await.unwrap();
        }

        // Six requests reached the counter; the rest were turned away by the block.
        assert_eq!(limiter.current_count(&key).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_other_ip_unaffected() {
        let limiter = create_test_limiter(Arc::new(InMemoryStorage::new()));

        for _ in 0..6 {
            limiter.allow_ip("192.168.1.1").await.unwrap();
        }

        assert!(!limiter.allow_ip("192.168.1.1").await.unwrap());
        assert!(limiter.allow_ip("192.168.1.2").await.unwrap());
    }

    #[tokio::test]
    async fn test_token_override_limit() {
        let limiter = create_test_limiter(Arc::new(InMemoryStorage::new()));

        for i in 1..=20 {
            assert!(limiter.allow_token("premium").await.unwrap(), "request {i}");
        }
        assert!(!limiter.allow_token("premium").await.unwrap());

        let ttl = limiter
            .remaining_block_duration(&CountingKey::token("premium"))
            .await
            .unwrap();
        assert!(ttl > Duration::from_secs(5) && ttl <= Duration::from_secs(10));

        // An unconfigured token uses the default rule and is unaffected.
        for i in 1..=10 {
            assert!(limiter.allow_token("standard").await.unwrap(), "request {i}");
        }
        assert!(!limiter.allow_token("standard").await.unwrap());
    }

    #[tokio::test]
    async fn test_ip_and_token_spaces_are_separate() {
        let limiter = create_test_limiter(Arc::new(InMemoryStorage::new()));

        for _ in 0..6 {
            limiter.allow_ip("shared").await.unwrap();
        }

        assert!(!limiter.allow_ip("shared").await.unwrap());
        assert!(limiter.allow_token("shared").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_lifts_after_duration() {
        let limiter = create_test_limiter(Arc::new(InMemoryStorage::new()));

        for _ in 0..6 {
            limiter.allow_ip("192.168.1.1").await.unwrap();
        }
        assert!(!limiter.allow_ip("192.168.1.1").await.unwrap());

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!limiter.allow_ip("192.168.1.1").await.unwrap());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.allow_ip("192.168.1.1").await.unwrap());
        assert_eq!(
            limiter
                .current_count(&CountingKey::ip("192.168.1.1"))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_after_idle_second() {
        let limiter = create_test_limiter(Arc::new(InMemoryStorage::new()));

        for _ in 0..5 {
            assert!(limiter.allow_ip("192.168.1.1").await.unwrap());
        }

        tokio::time::advance(WINDOW).await;

        for _ in 0..5 {
            assert!(limiter.allow_ip("192.168.1.1").await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_storage_failure_is_an_error() {
        let storage = Arc::new(InMemoryStorage::new());
        let limiter = create_test_limiter(storage.clone());
        storage.close().await.unwrap();

        let err = assert_err!(limiter.allow_ip("192.168.1.1").await);
        assert!(err.is_storage());
        assert!(matches!(
            err,
            TollgateError::Storage {
                operation: "check block",
                source: StorageError::Closed
            }
        ));
    }

    #[tokio::test]
    async fn test_failed_block_write_is_an_error() {
        let limiter = RateLimiter::new(
            Arc::new(UnblockableStorage {
                inner: InMemoryStorage::new(),
            }),
            Policy::new(
                LimitRule::new(2, Duration::from_secs(30)),
                LimitRule::new(2, Duration::from_secs(30)),
            ),
        );

        assert!(limiter.allow_ip("192.168.1.1").await.unwrap());
        assert!(limiter.allow_ip("192.168.1.1").await.unwrap());

        let err = assert_err!(limiter.allow_ip("192.168.1.1").await);
        assert!(matches!(
            err,
            TollgateError::Storage {
                operation: "set block",
                source: StorageError::Unavailable(_)
            }
        ));
        assert!(err.to_string().contains("set block"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires_mid_operation() {
        let limiter = RateLimiter::new(
            Arc::new(StalledStorage),
            Policy::new(
                LimitRule::new(5, Duration::from_secs(1)),
                LimitRule::new(5, Duration::from_secs(1)),
            ),
        );

        let deadline = Instant::now() + Duration::from_millis(100);
        let err = assert_err!(limiter.allow_ip_until("192.168.1.1", deadline).await);

        assert!(matches!(
            err,
            TollgateError::Storage {
                operation: "increment counter",
                source: StorageError::DeadlineExceeded
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_timeout_applies_without_deadline() {
        let limiter = RateLimiter::new(
            Arc::new(StalledStorage),
            Policy::new(
                LimitRule::new(5, Duration::from_secs(1)),
                LimitRule::new(5, Duration::from_secs(1)),
            ),
        )
        .with_operation_timeout(Duration::from_millis(250));

        let err = assert_err!(limiter.allow_token("abc").await);
        assert!(err.is_storage());
    }

    #[tokio::test]
    async fn test_expired_deadline_fails_before_touching_storage() {
        let storage = Arc::new(InMemoryStorage::new());
        let limiter = create_test_limiter(storage.clone());

        let deadline = Instant::now() - Duration::from_millis(1);
        assert_err!(limiter.allow_ip_until("192.168.1.1", deadline).await);
        assert!(storage.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_allow_exactly_limit() {
        let limiter = Arc::new(create_test_limiter(Arc::new(InMemoryStorage::new())));

        let tasks = (0..50).map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.allow_ip("198.51.100.7").await })
        });

        let allowed = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|joined| *joined.as_ref().unwrap().as_ref().unwrap())
            .count();

        assert_eq!(allowed, 5);
    }
}
