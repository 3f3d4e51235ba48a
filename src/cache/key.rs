//! Content Addressing
//!
//! Derives the stable cache key for a tenant request from
//! `hostname || path || query` using SHA-256.

use sha2::{Digest, Sha256};

/// Length of a hex-encoded cache key
pub const KEY_HEX_LEN: usize = 64;

/// Cache key - SHA-256 digest of hostname and request target
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    /// Derive a key from a hostname and a request target (path plus optional `?query`)
    pub fn derive(hostname: &str, path_and_query: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(hostname.as_bytes());
        hasher.update(path_and_query.as_bytes());
        Self(hasher.finalize().into())
    }

    /// Derive a key from a hostname, path and query parts
    pub fn from_parts(hostname: &str, path: &str, query: Option<&str>) -> Self {
        match query {
            Some(q) if !q.is_empty() => Self::derive(hostname, &format!("{}?{}", path, q)),
            _ => Self::derive(hostname, path),
        }
    }

    /// Parse a key from its hex representation (durable-tier file names)
    pub fn from_hex(hex_str: &str) -> Option<Self> {
        if hex_str.len() != KEY_HEX_LEN {
            return None;
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex_str, &mut bytes).ok()?;
        Some(Self(bytes))
    }

    /// Hex digest, used to address records in every tier
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CacheKey({})", &self.to_hex()[..12])
    }
}
