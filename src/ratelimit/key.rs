//! Counting key generation and handling.

use std::fmt;

/// The identity space a counting key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Requests identified by client IP address
    Ip,
    /// Requests identified by an API token
    Token,
}

impl Namespace {
    /// The tag prefixed to every key in this namespace.
    pub fn tag(&self) -> &'static str {
        match self {
            Namespace::Ip => "ip",
            Namespace::Token => "token",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A key that uniquely identifies one counter and one block record.
///
/// The key is the namespace tag and the raw identity joined by `:`, so an IP
/// and a token with the same text never share state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CountingKey {
    namespace: Namespace,
    key: String,
}

impl CountingKey {
    /// Create a new counting key from a namespace and a raw identity.
    pub fn new(namespace: Namespace, identity: &str) -> Self {
        Self {
            namespace,
            key: format!("{}:{}", namespace.tag(), identity),
        }
    }

    /// Key for a client IP address.
    pub fn ip(ip: &str) -> Self {
        Self::new(Namespace::Ip, ip)
    }

    /// Key for an API token.
    pub fn token(token: &str) -> Self {
        Self::new(Namespace::Token, token)
    }

    /// The namespace this key belongs to.
    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    /// The raw identity, without the namespace tag.
    pub fn identity(&self) -> &str {
        &self.key[self.namespace.tag().len() + 1..]
    }

    /// The full key as handed to storage.
    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for CountingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl AsRef<str> for CountingKey {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}
