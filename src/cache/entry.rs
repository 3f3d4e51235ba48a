//! Cache Entry Types
//!
//! A cached response is a header map plus an opaque body, bounded by
//! `created_at < expires_at`. Entries are immutable once written; a fresh
//! fetch replaces the whole entry under the same key.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::key::CacheKey;

/// Longest TTL honoured (2^31 seconds, the delta-seconds ceiling of RFC 9111)
pub const MAX_TTL: Duration = Duration::from_secs(1 << 31);

/// Response headers as stored in the cache (lower-case names)
pub type HeaderMap = BTreeMap<String, HeaderValues>;

/// Value(s) of one stored header.
///
/// Headers that cannot be comma-joined (`set-cookie`) keep one string per
/// field line; on disk they are a JSON array, every other header a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValues {
    One(String),
    Many(Vec<String>),
}

impl HeaderValues {
    /// First (usually only) value
    pub fn first(&self) -> &str {
        match self {
            Self::One(v) => v,
            Self::Many(vs) => vs.first().map(String::as_str).unwrap_or_default(),
        }
    }

    /// Every field line, in origin order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let values: &[String] = match self {
            Self::One(v) => std::slice::from_ref(v),
            Self::Many(vs) => vs,
        };
        values.iter().map(String::as_str)
    }
}

impl From<&str> for HeaderValues {
    fn from(value: &str) -> Self {
        Self::One(value.to_string())
    }
}

impl From<String> for HeaderValues {
    fn from(value: String) -> Self {
        Self::One(value)
    }
}

impl From<Vec<String>> for HeaderValues {
    fn from(mut values: Vec<String>) -> Self {
        if values.len() == 1 {
            Self::One(values.remove(0))
        } else {
            Self::Many(values)
        }
    }
}

/// Headers that describe a single connection and are never cached or replayed
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Metadata record stored alongside each body in the durable tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMetadata {
    /// Request target the entry was fetched for (diagnostic only)
    #[serde(default)]
    pub url: String,
    /// Origin response headers
    pub headers: HeaderMap,
    /// Expiry instant (epoch milliseconds on disk)
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
    /// Creation instant (epoch milliseconds on disk)
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl EntryMetadata {
    /// Check if the record has expired at `now`
    #[inline]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Cache entry containing response headers, body and validity window
#[derive(Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Content address of the entry
    pub key: CacheKey,
    /// Request target the entry was fetched for
    pub url: String,
    /// Origin response headers
    pub headers: HeaderMap,
    /// Response body (zero-copy)
    pub body: Bytes,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Expiry time (always after `created_at`)
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Create a new entry valid for `ttl` from now.
    ///
    /// A zero TTL is bumped to one second so that `expires_at > created_at`
    /// holds; callers decide cacheability before building entries. TTLs are
    /// capped at [`MAX_TTL`].
    pub fn new(
        key: CacheKey,
        url: impl Into<String>,
        headers: HeaderMap,
        body: Bytes,
        ttl: Duration,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            key,
            url: url.into(),
            headers: strip_hop_by_hop(headers),
            body,
            created_at,
            expires_at: expiry_after(created_at, ttl),
        }
    }

    /// Rebuild an entry from a durable metadata record and its body
    pub fn from_parts(key: CacheKey, metadata: EntryMetadata, body: Bytes) -> Self {
        Self {
            key,
            url: metadata.url,
            headers: metadata.headers,
            body,
            created_at: metadata.created_at,
            expires_at: metadata.expires_at,
        }
    }

    /// Metadata record for the durable tier
    pub fn metadata(&self) -> EntryMetadata {
        EntryMetadata {
            url: self.url.clone(),
            headers: self.headers.clone(),
            expires_at: self.expires_at,
            created_at: self.created_at,
        }
    }

    /// Body size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.body.len()
    }

    /// Check if the entry has expired
    #[inline]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Time left before expiry, `None` once expired.
    ///
    /// Rounded up to whole seconds, matching the TTL granularity of the
    /// hot tier.
    pub fn remaining_ttl(&self) -> Option<Duration> {
        let remaining = self.expires_at - Utc::now();
        let millis = remaining.num_milliseconds();
        if millis <= 0 {
            return None;
        }
        let secs = (millis as u64).div_ceil(1000);
        Some(Duration::from_secs(secs))
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("url", &self.url)
            .field("size", &self.body.len())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// `start + ttl`, with the TTL clamped to `[1s, MAX_TTL]`
fn expiry_after(start: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    let clamped = ttl.clamp(Duration::from_secs(1), MAX_TTL);
    let delta = chrono::Duration::seconds(clamped.as_secs() as i64)
        + chrono::Duration::nanoseconds(clamped.subsec_nanos() as i64);
    start
        .checked_add_signed(delta)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Drop connection-scoped headers from a header map
pub fn strip_hop_by_hop(mut headers: HeaderMap) -> HeaderMap {
    headers.retain(|name, _| !HOP_BY_HOP_HEADERS.contains(&name.as_str()));
    headers
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn headers() -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("content-type".into(), "text/plain".into());
        h.insert("transfer-encoding".into(), "chunked".into());
        h
    }

    #[test]
    fn test_entry_window_is_positive() {
        let key = CacheKey::derive("example.com", "/");
        let entry = CacheEntry::new(key, "/", headers(), Bytes::from("hi"), Duration::ZERO);
        assert!(entry.expires_at > entry.created_at);
    }

    #[test]
    fn test_entry_strips_hop_by_hop() {
        let key = CacheKey::derive("example.com", "/");
        let entry = CacheEntry::new(key, "/", headers(), Bytes::new(), Duration::from_secs(60));
        assert!(entry.headers.contains_key("content-type"));
        assert!(!entry.headers.contains_key("transfer-encoding"));
    }

    #[test]
    fn test_remaining_ttl_rounds_up() {
        let key = CacheKey::derive("example.com", "/");
        let entry = CacheEntry::new(key, "/", headers(), Bytes::new(), Duration::from_secs(60));
        let ttl = entry.remaining_ttl().unwrap();
        assert!(ttl <= Duration::from_secs(60));
        assert!(ttl >= Duration::from_secs(59));
    }

    #[test]
    fn test_remaining_ttl_none_when_expired() {
        let key = CacheKey::derive("example.com", "/");
        let mut entry = CacheEntry::new(key, "/", headers(), Bytes::new(), Duration::from_secs(60));
        entry.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(entry.is_expired());
        assert!(entry.remaining_ttl().is_none());
    }

    #[test]
    fn test_huge_ttl_is_capped() {
        let key = CacheKey::derive("example.com", "/forever");
        for ttl in [Duration::from_secs(99_999_999_999_999), Duration::from_secs(u64::MAX), Duration::MAX] {
            let entry = CacheEntry::new(key, "/forever", headers(), Bytes::new(), ttl);
            let window = entry.expires_at - entry.created_at;
            assert_eq!(window.num_seconds(), MAX_TTL.as_secs() as i64);
            assert!(entry.remaining_ttl().unwrap() <= MAX_TTL);
        }
    }

    #[test]
    fn test_set_cookie_lines_survive_metadata() {
        let mut h = headers();
        h.insert(
            "set-cookie".into(),
            vec![
                "a=1; Expires=Wed, 21 Oct 2026 07:28:00 GMT".to_string(),
                "b=2".to_string(),
            ]
            .into(),
        );
        let key = CacheKey::derive("example.com", "/login");
        let entry = CacheEntry::new(key, "/login", h, Bytes::new(), Duration::from_secs(10));

        let json = serde_json::to_value(entry.metadata()).unwrap();
        assert_eq!(json["headers"]["set-cookie"][1], "b=2");
        assert_eq!(json["headers"]["content-type"], "text/plain");

        let back: EntryMetadata = serde_json::from_value(json).unwrap();
        let cookies: Vec<&str> = back.headers["set-cookie"].iter().collect();
        assert_eq!(cookies, ["a=1; Expires=Wed, 21 Oct 2026 07:28:00 GMT", "b=2"]);
        assert_eq!(back.headers["content-type"].first(), "text/plain");
    }

    #[test]
    fn test_metadata_json_layout() {
        let key = CacheKey::derive("example.com", "/a");
        let entry = CacheEntry::new(key, "/a", headers(), Bytes::new(), Duration::from_secs(10));
        let json = serde_json::to_value(entry.metadata()).unwrap();
        assert!(json["expiresAt"].is_i64());
        assert!(json["createdAt"].is_i64());
        assert_eq!(json["headers"]["content-type"], "text/plain");

        let back: EntryMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(
            back.expires_at.timestamp_millis(),
            entry.expires_at.timestamp_millis()
        );
    }
}
