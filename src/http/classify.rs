//! Request classification: which identity a request is counted against.

use std::fmt;
use std::net::SocketAddr;

use axum::http::header::{HeaderMap, HeaderName};

use crate::ratelimit::{CountingKey, Namespace};

/// Header carrying the API token.
pub const API_KEY_HEADER: HeaderName = HeaderName::from_static("api_key");
/// Proxy chain header; the first entry is the originating client.
pub const FORWARDED_FOR_HEADER: HeaderName = HeaderName::from_static("x-forwarded-for");
/// Single-address header set by some proxies.
pub const REAL_IP_HEADER: HeaderName = HeaderName::from_static("x-real-ip");

/// The identity a request is rate limited by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// The request carried an API token.
    Token(String),
    /// No token; the request is counted against the client IP.
    Ip(String),
}

impl Identity {
    /// The namespace this identity is counted in.
    pub fn namespace(&self) -> Namespace {
        match self {
            Identity::Token(_) => Namespace::Token,
            Identity::Ip(_) => Namespace::Ip,
        }
    }

    /// The raw identity value.
    pub fn value(&self) -> &str {
        match self {
            Identity::Token(value) | Identity::Ip(value) => value,
        }
    }

    /// The counting key for this identity.
    pub fn key(&self) -> CountingKey {
        CountingKey::new(self.namespace(), self.value())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace(), self.value())
    }
}

/// No identity could be derived from the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unidentified;

/// Classify a request by its headers and transport peer.
///
/// A non-empty API token always wins, even when it has no configured limit.
/// Otherwise the client IP is taken from the first `X-Forwarded-For` entry,
/// then `X-Real-IP`, then the peer address without its port.
pub fn classify(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
) -> std::result::Result<Identity, Unidentified> {
    if let Some(token) = header_str(headers, &API_KEY_HEADER) {
        return Ok(Identity::Token(token.to_string()));
    }

    client_ip(headers, peer).map(Identity::Ip).ok_or(Unidentified)
}

/// Derive the client IP for a request without a token.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    let forwarded = header_str(headers, &FORWARDED_FOR_HEADER)
        .and_then(|chain| chain.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());

    forwarded
        .or_else(|| header_str(headers, &REAL_IP_HEADER).map(str::trim))
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
}

/// A header value as text, treating empty and non-UTF-8 values as absent.
fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&HeaderName, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert((*name).clone(), HeaderValue::from_str(value).unwrap());
        }
        map
    }

    fn peer() -> Option<SocketAddr> {
        Some("192.168.1.1:12345".parse().unwrap())
    }

    #[test]
    fn test_token_takes_priority() {
        let map = headers(&[
            (&API_KEY_HEADER, "abc123"),
            (&FORWARDED_FOR_HEADER, "203.0.113.9"),
        ]);

        let identity = classify(&map, peer()).unwrap();
        assert_eq!(identity, Identity::Token("abc123".to_string()));
        assert_eq!(identity.key().as_str(), "token:abc123");
    }

    #[test]
    fn test_empty_token_falls_back_to_ip() {
        let map = headers(&[(&API_KEY_HEADER, "")]);
        assert_eq!(
            classify(&map, peer()).unwrap(),
            Identity::Ip("192.168.1.1".to_string())
        );
    }

    #[test]
    fn test_forwarded_for_first_entry() {
        let map = headers(&[
            (&FORWARDED_FOR_HEADER, " 203.0.113.9 , 10.0.0.1, 10.0.0.2"),
            (&REAL_IP_HEADER, "198.51.100.1"),
        ]);
        assert_eq!(client_ip(&map, peer()).as_deref(), Some("203.0.113.9"));
    }

    #[test]
    fn test_real_ip_when_no_forwarded_for() {
        let map = headers(&[(&REAL_IP_HEADER, "198.51.100.1")]);
        assert_eq!(client_ip(&map, peer()).as_deref(), Some("198.51.100.1"));
    }

    #[test]
    fn test_blank_forwarded_entry_moves_on() {
        let map = headers(&[
            (&FORWARDED_FOR_HEADER, " , 10.0.0.1"),
            (&REAL_IP_HEADER, "198.51.100.1"),
        ]);
        assert_eq!(client_ip(&map, peer()).as_deref(), Some("198.51.100.1"));
    }

    #[test]
    fn test_peer_address_port_stripped() {
        assert_eq!(
            client_ip(&HeaderMap::new(), peer()).as_deref(),
            Some("192.168.1.1")
        );

        let v6: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        assert_eq!(
            client_ip(&HeaderMap::new(), Some(v6)).as_deref(),
            Some("2001:db8::1")
        );
    }

    #[test]
    fn test_no_identity() {
        assert_eq!(classify(&HeaderMap::new(), None), Err(Unidentified));
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(Identity::Ip("1.2.3.4".to_string()).to_string(), "ip:1.2.3.4");
        assert_eq!(Identity::Token("t".to_string()).to_string(), "token:t");
    }
}
