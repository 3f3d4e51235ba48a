//! Origin Fetcher
//!
//! Forwards a request to the tenant origin and buffers the full response.
//! The client `Host` is replaced by the origin's, `Accept-Encoding` is not
//! forwarded (stored bodies stay identity-encoded and are compressed per
//! client on the way out), and connection-scoped headers are dropped.
//! Redirects are passed through to the client, never followed.

use std::time::Duration;

use bytes::Bytes;
use hyper::header::{self, HeaderMap};
use hyper::{Method, StatusCode};
use reqwest::Client;
use tracing::instrument;

use crate::cache::entry::{
    strip_hop_by_hop, HeaderMap as StoredHeaders, HeaderValues, HOP_BY_HOP_HEADERS, MAX_TTL,
};
use crate::error::{Error, Result};

/// Default origin request timeout
pub const DEFAULT_ORIGIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Origin fetcher configuration
#[derive(Debug, Clone)]
pub struct OriginConfig {
    /// TTL used when the origin sends no `max-age`
    pub default_ttl: Duration,
    /// Whole-request timeout
    pub timeout: Duration,
    /// User agent used when the client sent none
    pub user_agent: String,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(crate::cache::DEFAULT_TTL_SECS),
            timeout: DEFAULT_ORIGIN_TIMEOUT,
            user_agent: format!("pravah/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Buffered origin response
#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status: StatusCode,
    /// Response headers (lower-case names, hop-by-hop removed)
    pub headers: StoredHeaders,
    pub body: Bytes,
    /// TTL derived from `Cache-Control`
    pub ttl: Duration,
}

impl OriginResponse {
    /// Whether this response may be written to the cache for `method`
    pub fn is_cacheable(&self, method: &Method) -> bool {
        *method == Method::GET && self.status == StatusCode::OK && !self.ttl.is_zero()
    }
}

/// HTTP client for tenant origins
#[derive(Debug, Clone)]
pub struct OriginFetcher {
    client: Client,
    config: OriginConfig,
}

impl OriginFetcher {
    pub fn new(config: OriginConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .use_rustls_tls()
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &OriginConfig {
        &self.config
    }

    /// Fetch `path_and_query` from `origin`
    #[instrument(skip_all, fields(origin = %origin, method = %method, path = %path_and_query))]
    pub async fn fetch(
        &self,
        origin: &str,
        method: &Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<OriginResponse> {
        let url = origin_url(origin, path_and_query);
        let gateway = |reason: String| Error::Gateway {
            origin: origin.to_string(),
            reason,
        };

        let mut request = self
            .client
            .request(method.clone(), &url)
            .headers(forwarded_headers(headers));
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request.send().await.map_err(|e| gateway(e.to_string()))?;
        let status = response.status();
        let response_headers = stored_headers(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|e| gateway(format!("failed to read response: {}", e)))?;

        let ttl = derive_ttl(
            response_headers.get("cache-control").map(HeaderValues::first),
            self.config.default_ttl,
        );

        tracing::debug!(%url, status = status.as_u16(), bytes = body.len(), ttl_secs = ttl.as_secs(), "Origin responded");

        Ok(OriginResponse {
            status,
            headers: response_headers,
            body,
            ttl,
        })
    }
}

/// Join an origin base URL and a request target
pub fn origin_url(origin: &str, path_and_query: &str) -> String {
    let base = origin.trim_end_matches('/');
    if path_and_query.starts_with('/') {
        format!("{}{}", base, path_and_query)
    } else {
        format!("{}/{}", base, path_and_query)
    }
}

/// TTL from a `Cache-Control` value: `max-age` when present, else `default`.
///
/// Values beyond [`MAX_TTL`], including ones too large for `u64`, are
/// capped to it.
pub fn derive_ttl(cache_control: Option<&str>, default: Duration) -> Duration {
    cache_control
        .into_iter()
        .flat_map(|v| v.split(','))
        .filter_map(|directive| {
            let directive = directive.trim().to_ascii_lowercase();
            let secs = directive.strip_prefix("max-age=")?.trim_matches('"').to_string();
            if secs.is_empty() || !secs.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            Some(secs.parse::<u64>().map(Duration::from_secs).unwrap_or(MAX_TTL))
        })
        .next()
        .map(|ttl| ttl.min(MAX_TTL))
        .unwrap_or(default)
}

/// Client headers to send upstream
fn forwarded_headers(client: &HeaderMap) -> HeaderMap {
    let mut headers = client.clone();
    headers.remove(header::HOST);
    headers.remove(header::ACCEPT_ENCODING);
    headers.remove(header::CONTENT_LENGTH);
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
    headers
}

/// Origin headers in stored form. Repeated values are joined with `, `,
/// except `set-cookie`, which keeps one value per field line.
fn stored_headers(origin: &HeaderMap) -> StoredHeaders {
    let mut stored = StoredHeaders::new();
    for name in origin.keys() {
        let values: Vec<String> = origin
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect();
        let values = if *name == header::SET_COOKIE {
            HeaderValues::from(values)
        } else {
            HeaderValues::One(values.join(", "))
        };
        stored.insert(name.as_str().to_string(), values);
    }
    strip_hop_by_hop(stored)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use hyper::header::HeaderValue;

    #[test]
    fn test_derive_ttl() {
        let default = Duration::from_secs(3600);
        assert_eq!(derive_ttl(None, default), default);
        assert_eq!(derive_ttl(Some("public, max-age=120"), default), Duration::from_secs(120));
        assert_eq!(derive_ttl(Some("Max-Age=30"), default), Duration::from_secs(30));
        assert_eq!(derive_ttl(Some("no-cache"), default), default);
        assert_eq!(derive_ttl(Some("max-age=abc"), default), default);
        assert_eq!(derive_ttl(Some("max-age=0"), default), Duration::ZERO);
        assert_eq!(derive_ttl(Some("max-age=-5"), default), default);
    }

    #[test]
    fn test_derive_ttl_caps_huge_max_age() {
        let default = Duration::from_secs(3600);
        assert_eq!(derive_ttl(Some("max-age=99999999999999"), default), MAX_TTL);
        assert_eq!(
            derive_ttl(Some("max-age=999999999999999999999999999"), default),
            MAX_TTL
        );
        assert_eq!(derive_ttl(Some("max-age=2147483647"), default), Duration::from_secs(2_147_483_647));

        // The capped TTL builds a valid entry
        let key = crate::cache::CacheKey::derive("example.com", "/");
        let ttl = derive_ttl(Some("max-age=99999999999999"), default);
        let entry = crate::cache::CacheEntry::new(key, "/", StoredHeaders::new(), Bytes::new(), ttl);
        assert!(entry.expires_at > entry.created_at);
    }

    #[test]
    fn test_origin_url() {
        assert_eq!(origin_url("http://o.test/", "/a?b=1"), "http://o.test/a?b=1");
        assert_eq!(origin_url("http://o.test", "a"), "http://o.test/a");
    }

    #[test]
    fn test_forwarded_headers() {
        let mut client = HeaderMap::new();
        client.insert(header::HOST, HeaderValue::from_static("cdn.example.com"));
        client.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        client.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        client.insert(header::ACCEPT, HeaderValue::from_static("text/html"));

        let forwarded = forwarded_headers(&client);
        assert!(forwarded.get(header::HOST).is_none());
        assert!(forwarded.get(header::ACCEPT_ENCODING).is_none());
        assert!(forwarded.get(header::CONNECTION).is_none());
        assert_eq!(forwarded.get(header::ACCEPT).unwrap(), "text/html");
    }

    #[test]
    fn test_stored_headers_join_and_strip() {
        let mut origin = HeaderMap::new();
        origin.append(header::VARY, HeaderValue::from_static("accept"));
        origin.append(header::VARY, HeaderValue::from_static("origin"));
        origin.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));

        let stored = stored_headers(&origin);
        assert_eq!(stored["vary"].first(), "accept, origin");
        assert!(!stored.contains_key("transfer-encoding"));
    }

    #[test]
    fn test_set_cookie_lines_are_kept_apart() {
        let mut origin = HeaderMap::new();
        origin.append(
            header::SET_COOKIE,
            HeaderValue::from_static("a=1; Expires=Wed, 21 Oct 2026 07:28:00 GMT"),
        );
        origin.append(header::SET_COOKIE, HeaderValue::from_static("b=2"));

        let stored = stored_headers(&origin);
        let cookies: Vec<&str> = stored["set-cookie"].iter().collect();
        assert_eq!(cookies, ["a=1; Expires=Wed, 21 Oct 2026 07:28:00 GMT", "b=2"]);
    }

    #[test]
    fn test_cacheability() {
        let mut response = OriginResponse {
            status: StatusCode::OK,
            headers: StoredHeaders::new(),
            body: Bytes::new(),
            ttl: Duration::from_secs(60),
        };
        assert!(response.is_cacheable(&Method::GET));
        assert!(!response.is_cacheable(&Method::POST));
        assert!(!response.is_cacheable(&Method::HEAD));

        response.ttl = Duration::ZERO;
        assert!(!response.is_cacheable(&Method::GET));

        response.ttl = Duration::from_secs(60);
        response.status = StatusCode::NOT_FOUND;
        assert!(!response.is_cacheable(&Method::GET));
    }

    #[tokio::test]
    async fn test_unreachable_origin_is_gateway_error() {
        let fetcher = OriginFetcher::new(OriginConfig {
            timeout: Duration::from_secs(2),
            ..Default::default()
        })
        .unwrap();

        let result = fetcher
            .fetch("http://127.0.0.1:1", &Method::GET, "/", &HeaderMap::new(), Bytes::new())
            .await;
        assert_matches!(result, Err(Error::Gateway { .. }));
    }
}
