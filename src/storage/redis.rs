//! Redis storage backend.
//!
//! Counters live under `counter:<key>` and blocks under `block:<key>`. The
//! counter increment and its expiration are applied by one Lua script so the
//! server never holds a counter without a TTL.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{debug, info};

use super::{Storage, StorageError};

const COUNTER_PREFIX: &str = "counter:";
const BLOCK_PREFIX: &str = "block:";

const INCREMENT_SCRIPT: &str = r"
local current = redis.call('INCR', KEYS[1])
redis.call('PEXPIRE', KEYS[1], ARGV[1])
return current
";

/// Connection settings for [`RedisStorage`].
#[derive(Debug, Clone)]
pub struct RedisSettings {
    /// `host:port` of the Redis server
    pub addr: String,
    /// Optional password
    pub password: Option<String>,
    /// Logical database index
    pub db: i64,
    /// How long to wait for the initial PING
    pub connect_timeout: Duration,
}

impl RedisSettings {
    /// Build the `redis://` connection URL for these settings.
    pub fn url(&self) -> String {
        match self.password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => format!("redis://:{}@{}/{}", password, self.addr, self.db),
            None => format!("redis://{}/{}", self.addr, self.db),
        }
    }
}

/// Storage backed by a shared Redis server.
pub struct RedisStorage {
    connection: ConnectionManager,
    increment: Script,
    closed: AtomicBool,
}

impl RedisStorage {
    /// Connect to Redis and verify the connection with a PING.
    pub async fn connect(settings: &RedisSettings) -> Result<Self, StorageError> {
        let client = Client::open(settings.url())?;

        let connection = tokio::time::timeout(settings.connect_timeout, async {
            let mut connection = ConnectionManager::new(client).await?;
            let _: String = redis::cmd("PING").query_async(&mut connection).await?;
            Ok::<_, redis::RedisError>(connection)
        })
        .await
        .map_err(|_| {
            StorageError::Unavailable(format!(
                "no PONG from {} within {:?}",
                settings.addr, settings.connect_timeout
            ))
        })??;

        info!(addr = %settings.addr, db = settings.db, "Connected to Redis");

        Ok(Self::with_connection(connection))
    }

    /// Wrap an already established connection.
    pub fn with_connection(connection: ConnectionManager) -> Self {
        Self {
            connection,
            increment: Script::new(INCREMENT_SCRIPT),
            closed: AtomicBool::new(false),
        }
    }

    fn connection(&self) -> Result<ConnectionManager, StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(self.connection.clone())
    }
}

fn millis(duration: Duration) -> u64 {
    // PEXPIRE/PX reject zero; round sub-millisecond durations up.
    (duration.as_millis() as u64).max(1)
}

#[async_trait]
impl Storage for RedisStorage {
    async fn increment(&self, key: &str, expiration: Duration) -> Result<u64, StorageError> {
        let mut connection = self.connection()?;
        let count: u64 = self
            .increment
            .key(format!("{COUNTER_PREFIX}{key}"))
            .arg(millis(expiration))
            .invoke_async(&mut connection)
            .await?;
        Ok(count)
    }

    async fn get(&self, key: &str) -> Result<u64, StorageError> {
        let mut connection = self.connection()?;
        let count: Option<u64> = redis::cmd("GET")
            .arg(format!("{COUNTER_PREFIX}{key}"))
            .query_async(&mut connection)
            .await?;
        Ok(count.unwrap_or(0))
    }

    async fn set_block(&self, key: &str, duration: Duration) -> Result<(), StorageError> {
        let mut connection = self.connection()?;
        let _: () = redis::cmd("SET")
            .arg(format!("{BLOCK_PREFIX}{key}"))
            .arg("1")
            .arg("PX")
            .arg(millis(duration))
            .query_async(&mut connection)
            .await?;
        Ok(())
    }

    async fn is_blocked(&self, key: &str) -> Result<bool, StorageError> {
        let mut connection = self.connection()?;
        let value: Option<String> = redis::cmd("GET")
            .arg(format!("{BLOCK_PREFIX}{key}"))
            .query_async(&mut connection)
            .await?;
        Ok(value.as_deref() == Some("1"))
    }

    async fn ttl(&self, key: &str) -> Result<Duration, StorageError> {
        let mut connection = self.connection()?;
        // -2: no such key, -1: key without expiration
        let pttl: i64 = redis::cmd("PTTL")
            .arg(format!("{BLOCK_PREFIX}{key}"))
            .query_async(&mut connection)
            .await?;
        Ok(Duration::from_millis(pttl.max(0) as u64))
    }

    async fn close(&self) -> Result<(), StorageError> {
        // The connection manager closes its socket when the last clone drops.
        self.closed.store(true, Ordering::Release);
        debug!("Redis storage closed");
        Ok(())
    }
}
