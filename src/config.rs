//! Configuration management for Tollgate.
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! `TOLLGATE__SECTION__FIELD` environment variables, and finally the flat
//! variables the service has always understood (`IP_RATE_LIMIT`,
//! `API_KEY_<TOKEN>=<LIMIT>:<BLOCK_SECONDS>`, ...).

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsString;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Result, TollgateError};
use crate::storage::RedisSettings;

/// Prefix of environment variables that define token overrides.
const TOKEN_ENV_PREFIX: &str = "API_KEY_";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Backing store configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP port, bound on all interfaces
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl ServerConfig {
    /// The socket address the HTTP server listens on.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port))
    }
}

fn default_port() -> u16 {
    8080
}

/// Which store backs the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Redis,
    Memory,
}

/// Backing store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Store implementation
    #[serde(default)]
    pub backend: StorageBackend,

    /// Redis `host:port`
    #[serde(default = "default_redis_addr")]
    pub redis_addr: String,

    /// Redis password
    #[serde(default)]
    pub redis_password: Option<String>,

    /// Redis logical database
    #[serde(default)]
    pub redis_db: i64,

    /// Deadline for a single rate limit decision in milliseconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// How long to wait for Redis at startup in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Interval between expired-record sweeps of the memory store
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            redis_addr: default_redis_addr(),
            redis_password: None,
            redis_db: 0,
            operation_timeout_ms: default_operation_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl StorageConfig {
    /// Per-decision deadline.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Memory store sweep interval.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Connection settings for the Redis store.
    pub fn redis_settings(&self) -> RedisSettings {
        RedisSettings {
            addr: self.redis_addr.clone(),
            password: self.redis_password.clone().filter(|p| !p.is_empty()),
            db: self.redis_db,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }
}

fn default_redis_addr() -> String {
    "localhost:6379".to_string()
}

fn default_operation_timeout() -> u64 {
    1000
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_sweep_interval() -> u64 {
    60
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Requests per second allowed per IP
    #[serde(default = "default_ip_limit")]
    pub ip_limit: u64,

    /// Lockout for an IP that exceeds its limit, in seconds
    #[serde(default = "default_block_duration")]
    pub ip_block_duration_secs: u64,

    /// Requests per second allowed per token without an override
    #[serde(default = "default_token_limit")]
    pub token_limit: u64,

    /// Lockout for a token without an override, in seconds
    #[serde(default = "default_block_duration")]
    pub token_block_duration_secs: u64,

    /// Per-token overrides
    #[serde(default)]
    pub tokens: HashMap<String, TokenLimitConfig>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            ip_limit: default_ip_limit(),
            ip_block_duration_secs: default_block_duration(),
            token_limit: default_token_limit(),
            token_block_duration_secs: default_block_duration(),
            tokens: HashMap::new(),
        }
    }
}

/// Limit override for one token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenLimitConfig {
    /// Requests per second
    pub limit: u64,
    /// Lockout in seconds
    pub block_duration_secs: u64,
}

impl FromStr for TokenLimitConfig {
    type Err = TollgateError;

    /// Parse the `<LIMIT>:<BLOCK_SECONDS>` form used in environment variables.
    fn from_str(s: &str) -> Result<Self> {
        let (limit, block) = s
            .split_once(':')
            .ok_or_else(|| TollgateError::Config(format!("expected LIMIT:SECONDS, got '{}'", s)))?;
        let parse = |part: &str| {
            part.trim()
                .parse::<u64>()
                .map_err(|e| TollgateError::Config(format!("invalid number '{}': {}", part, e)))
        };
        Ok(Self {
            limit: parse(limit)?,
            block_duration_secs: parse(block)?,
        })
    }
}

fn default_ip_limit() -> u64 {
    10
}

fn default_token_limit() -> u64 {
    100
}

fn default_block_duration() -> u64 {
    300
}

impl TollgateConfig {
    /// Load configuration from defaults, an optional YAML file and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                ::config::File::from(path).format(::config::FileFormat::Yaml),
            );
        }

        let mut config: TollgateConfig = builder
            .add_source(::config::Environment::with_prefix("TOLLGATE").separator("__"))
            .build()?
            .try_deserialize()?;

        config.apply_env(utf8_vars(std::env::vars_os()));
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = ::config::Config::builder()
            .add_source(::config::File::from_str(yaml, ::config::FileFormat::Yaml))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        let storage = &self.storage;
        let nonzero = [
            ("storage.operation_timeout_ms", storage.operation_timeout_ms),
            ("storage.connect_timeout_ms", storage.connect_timeout_ms),
            ("storage.sweep_interval_secs", storage.sweep_interval_secs),
        ];

        for (name, value) in nonzero {
            if value == 0 {
                return Err(TollgateError::Config(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }

    /// Apply the flat environment variables understood by the service.
    ///
    /// Unparseable values are ignored with a warning and leave the current
    /// setting untouched.
    pub fn apply_env<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            if value.is_empty() {
                continue;
            }

            let limits = &mut self.rate_limiting;
            match name.as_str() {
                "SERVER_PORT" => set_parsed(&name, &value, &mut self.server.port),
                "REDIS_ADDR" => self.storage.redis_addr = value,
                "REDIS_PASSWORD" => self.storage.redis_password = Some(value),
                "REDIS_DB" => set_parsed(&name, &value, &mut self.storage.redis_db),
                "IP_RATE_LIMIT" => set_parsed(&name, &value, &mut limits.ip_limit),
                "IP_BLOCK_DURATION" => {
                    set_parsed(&name, &value, &mut limits.ip_block_duration_secs)
                }
                "TOKEN_RATE_LIMIT" => set_parsed(&name, &value, &mut limits.token_limit),
                "TOKEN_BLOCK_DURATION" => {
                    set_parsed(&name, &value, &mut limits.token_block_duration_secs)
                }
                _ => {
                    let Some(token) = name.strip_prefix(TOKEN_ENV_PREFIX) else {
                        continue;
                    };
                    if token.is_empty() {
                        continue;
                    }
                    match value.parse::<TokenLimitConfig>() {
                        Ok(limit) => {
                            limits.tokens.insert(token.to_string(), limit);
                        }
                        Err(e) => warn!(variable = %name, error = %e, "Ignoring token override"),
                    }
                }
            }
        }
    }
}

/// Environment entries with UTF-8 names and values; anything else is skipped.
fn utf8_vars<I>(vars: I) -> impl Iterator<Item = (String, String)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter()
        .filter_map(|(name, value)| Some((name.into_string().ok()?, value.into_string().ok()?)))
}

fn set_parsed<T: FromStr>(name: &str, value: &str, target: &mut T) {
    match value.trim().parse() {
        Ok(parsed) => *target = parsed,
        Err(_) => warn!(variable = %name, value = %value, "Invalid value, keeping default"),
    }
}
