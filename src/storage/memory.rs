//! In-memory storage backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use super::{Storage, StorageError};

/// A counter value together with the instant it stops being valid.
#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    count: u64,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    counters: HashMap<String, CounterEntry>,
    /// Key -> instant the block ends
    blocks: HashMap<String, Instant>,
}

/// Storage kept in process memory.
///
/// Counters and blocks live behind a single lock. Expiration is evaluated
/// lazily against the current time whenever a record is read, so an expired
/// record behaves as absent even before [`InMemoryStorage::purge_expired`]
/// physically removes it.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    state: Mutex<State>,
    closed: AtomicBool,
}

impl InMemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every counter and block.
    ///
    /// This is primarily useful for testing.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.counters.clear();
        state.blocks.clear();
    }

    /// Remove records whose expiration has passed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let before = state.counters.len() + state.blocks.len();

        state.counters.retain(|_, entry| entry.expires_at > now);
        state.blocks.retain(|_, until| *until > now);

        let removed = before - (state.counters.len() + state.blocks.len());
        if removed > 0 {
            trace!(removed = removed, "Purged expired records");
        }
        removed
    }

    /// Number of records (counters plus blocks) currently held, expired or not.
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.counters.len() + state.blocks.len()
    }

    /// Returns `true` if no records are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn increment(&self, key: &str, expiration: Duration) -> Result<u64, StorageError> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut state = self.state.lock();

        let entry = state
            .counters
            .entry(key.to_string())
            .or_insert(CounterEntry { count: 0, expires_at: now });
        if entry.expires_at <= now {
            entry.count = 0;
        }
        entry.count += 1;
        entry.expires_at = now + expiration;

        Ok(entry.count)
    }

    async fn get(&self, key: &str) -> Result<u64, StorageError> {
        self.ensure_open()?;
        let now = Instant::now();
        let state = self.state.lock();

        Ok(state
            .counters
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map_or(0, |entry| entry.count))
    }

    async fn set_block(&self, key: &str, duration: Duration) -> Result<(), StorageError> {
        self.ensure_open()?;
        let until = Instant::now() + duration;
        self.state.lock().blocks.insert(key.to_string(), until);
        Ok(())
    }

    async fn is_blocked(&self, key: &str) -> Result<bool, StorageError> {
        self.ensure_open()?;
        let now = Instant::now();
        let state = self.state.lock();
        Ok(state.blocks.get(key).is_some_and(|until| *until > now))
    }

    async fn ttl(&self, key: &str) -> Result<Duration, StorageError> {
        self.ensure_open()?;
        let now = Instant::now();
        let state = self.state.lock();
        Ok(state
            .blocks
            .get(key)
            .map_or(Duration::ZERO, |until| until.saturating_duration_since(now)))
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::Release);
        self.reset();
        Ok(())
    }
}
