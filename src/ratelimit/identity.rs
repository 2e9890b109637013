//! Rate limit identity resolution.
//!
//! Every request is charged against exactly one identity: the trusted API key
//! it presents, or otherwise the client IP address.

use axum::http::HeaderMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use super::api_keys::ApiKeyRegistry;
use crate::config::LimitsConfig;

/// Namespace prefix for counter keys in the shared store.
pub const KEY_PREFIX: &str = "rate-limiter:";

/// Header carrying the caller's API key.
pub const API_KEY_HEADER: &str = "api_key";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
pub const REAL_IP_HEADER: &str = "x-real-ip";

/// Stand-in peer address when the transport exposes none.
pub const UNKNOWN_PEER: &str = "unknown";

/// The key a quota is tracked against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// Anonymous caller, keyed by resolved client address
    Ip(String),
    /// Caller holding a trusted API key, keyed by the key's id
    ApiKey(i64),
}

impl Identity {
    /// The part of the store key that follows [`KEY_PREFIX`].
    pub fn suffix(&self) -> String {
        match self {
            Identity::Ip(addr) => addr.clone(),
            Identity::ApiKey(id) => id.to_string(),
        }
    }

    /// Namespaced key of this identity's counter entry.
    pub fn store_key(&self) -> String {
        format!("{}{}", KEY_PREFIX, self.suffix())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Ip(addr) => write!(f, "ip:{}", addr),
            Identity::ApiKey(id) => write!(f, "key:{}", id),
        }
    }
}

/// An identity together with the limit that applies to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub identity: Identity,
    pub limit: u64,
}

/// Maps requests to identities using the trusted key list and configured limits.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    api_keys: Arc<ApiKeyRegistry>,
    default_limit: u64,
    api_key_limit: u64,
}

impl IdentityResolver {
    pub fn new(api_keys: Arc<ApiKeyRegistry>, limits: &LimitsConfig) -> Self {
        Self {
            api_keys,
            default_limit: limits.default_limit,
            api_key_limit: limits.api_key_limit,
        }
    }

    /// Resolve the identity for a request.
    ///
    /// `peer_addr` is the transport-level remote address as a string
    /// (`host:port`). An API key that is not in the registry is not an error;
    /// the request simply falls back to its client address.
    pub fn resolve(&self, headers: &HeaderMap, peer_addr: Option<&str>) -> ResolvedIdentity {
        let api_key = header_str(headers, API_KEY_HEADER).unwrap_or_default();

        if !api_key.is_empty() {
            if let Some(record) = self.api_keys.find(api_key) {
                return ResolvedIdentity {
                    identity: Identity::ApiKey(record.id),
                    limit: self.api_key_limit,
                };
            }
        }

        ResolvedIdentity {
            identity: Identity::Ip(client_ip(headers, peer_addr)),
            limit: self.default_limit,
        }
    }
}

/// Resolve the client address.
///
/// Precedence: first valid entry of `X-Forwarded-For`, then a valid
/// `X-Real-IP`, then the host part of the peer address. If the peer address
/// has no port to split off it is returned verbatim.
pub fn client_ip(headers: &HeaderMap, peer_addr: Option<&str>) -> String {
    if let Some(forwarded) = header_str(headers, FORWARDED_FOR_HEADER) {
        if let Some(ip) = forwarded
            .split(',')
            .map(str::trim)
            .find(|candidate| is_valid_ip(candidate))
        {
            return ip.to_string();
        }
    }

    if let Some(real_ip) = header_str(headers, REAL_IP_HEADER) {
        if is_valid_ip(real_ip) {
            return real_ip.to_string();
        }
    }

    match peer_addr {
        Some(peer) => split_host(peer).unwrap_or(peer).to_string(),
        None => UNKNOWN_PEER.to_string(),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn is_valid_ip(candidate: &str) -> bool {
    candidate.parse::<IpAddr>().is_ok()
}

/// Host portion of a `host:port` or `[v6]:port` string.
fn split_host(addr: &str) -> Option<&str> {
    if addr.parse::<SocketAddr>().is_ok() {
        let (host, _port) = addr.rsplit_once(':')?;
        return Some(host.trim_start_matches('[').trim_end_matches(']'));
    }

    let (host, port) = addr.rsplit_once(':')?;
    if host.is_empty() || host.contains(':') || port.is_empty() {
        return None;
    }
    port.chars().all(|c| c.is_ascii_digit()).then_some(host)
}
