//! Rate limit policy and per-token overrides.
//!
//! A [`Policy`] is built once at startup and shared read-only for the life of
//! the process.

use std::collections::HashMap;
use std::time::Duration;

use super::key::Namespace;
use crate::config::RateLimitingConfig;

/// A limit and the lockout applied when it is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitRule {
    /// Maximum requests allowed per one-second window
    pub limit: u64,
    /// How long the key stays blocked after exceeding `limit`
    pub block_duration: Duration,
}

impl LimitRule {
    /// Create a new rule.
    pub fn new(limit: u64, block_duration: Duration) -> Self {
        Self {
            limit,
            block_duration,
        }
    }

    /// Whether a post-increment count is over this rule's limit.
    pub fn is_exceeded_by(&self, count: u64) -> bool {
        count > self.limit
    }
}

/// The complete set of limits the engine enforces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    ip: LimitRule,
    default_token: LimitRule,
    token_overrides: HashMap<String, LimitRule>,
}

impl Policy {
    /// Create a policy with no token overrides.
    pub fn new(ip: LimitRule, default_token: LimitRule) -> Self {
        Self {
            ip,
            default_token,
            token_overrides: HashMap::new(),
        }
    }

    /// Add or replace the override for `token`.
    pub fn with_token_override(mut self, token: impl Into<String>, rule: LimitRule) -> Self {
        self.token_overrides.insert(token.into(), rule);
        self
    }

    /// The rule applied to every IP address.
    pub fn ip_rule(&self) -> LimitRule {
        self.ip
    }

    /// The rule applied to tokens without an override.
    pub fn default_token_rule(&self) -> LimitRule {
        self.default_token
    }

    /// The rule for `token`, falling back to the default token rule.
    pub fn token_rule(&self, token: &str) -> LimitRule {
        self.token_overrides
            .get(token)
            .copied()
            .unwrap_or(self.default_token)
    }

    /// Resolve the rule for an identity in the given namespace.
    pub fn rule_for(&self, namespace: Namespace, identity: &str) -> LimitRule {
        match namespace {
            Namespace::Ip => self.ip_rule(),
            Namespace::Token => self.token_rule(identity),
        }
    }

    /// Number of tokens with an explicit override.
    pub fn override_count(&self) -> usize {
        self.token_overrides.len()
    }
}

impl From<&RateLimitingConfig> for Policy {
    fn from(config: &RateLimitingConfig) -> Self {
        let ip = LimitRule::new(
            config.ip_limit,
            Duration::from_secs(config.ip_block_duration_secs),
        );
        let default_token = LimitRule::new(
            config.token_limit,
            Duration::from_secs(config.token_block_duration_secs),
        );

        config
            .tokens
            .iter()
            .fold(Policy::new(ip, default_token), |policy, (token, limit)| {
                policy.with_token_override(
                    token.clone(),
                    LimitRule::new(limit.limit, Duration::from_secs(limit.block_duration_secs)),
                )
            })
    }
}
