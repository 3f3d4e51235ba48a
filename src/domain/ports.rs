//! Domain Ports (Port/Adapter Pattern)
//!
//! The request path depends only on these traits. Default adapters live in
//! `crate::adapters`; tests plug in their own.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Request Path                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  TenantStore │ SecurityFilter │ EdgeHook │ Transform │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Adapters (Impls)                         │
//! │  JsonTenantStore │ PatternFilter │ BuiltinRules │ Stats     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::net::IpAddr;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::{HeaderMap, Method, Response};
use serde::{Deserialize, Serialize};

use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

/// Per-tenant configuration record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantConfig {
    /// Origin base URL, e.g. `https://origin.example.com`
    pub origin: String,
    /// Rules run by the extensibility hook in the request phase
    #[serde(default)]
    pub edge_rules: Vec<EdgeRule>,
    /// Billing plan label
    #[serde(default = "default_plan")]
    pub plan: String,
}

fn default_plan() -> String {
    "free".to_string()
}

impl TenantConfig {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            edge_rules: Vec::new(),
            plan: default_plan(),
        }
    }
}

/// Optional attributes supplied when registering a domain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantAttrs {
    #[serde(default)]
    pub edge_rules: Vec<EdgeRule>,
    #[serde(default)]
    pub plan: Option<String>,
}

/// Edge rule attached to a tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EdgeRule {
    /// Redirect requests whose path equals `from`
    Redirect {
        from: String,
        to: String,
        #[serde(default = "default_redirect_status")]
        status: u16,
    },
    /// Reject requests whose path starts with `prefix`
    Deny { prefix: String },
    /// Rule kinds this node does not implement
    #[serde(other)]
    Unsupported,
}

fn default_redirect_status() -> u16 {
    302
}

/// Phase in which an edge hook runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    /// Before cache lookup
    Request,
}

/// Outcome of one hook invocation
#[derive(Debug)]
pub enum HookOutcome {
    /// Continue the pipeline
    Continue,
    /// Stop; the hook produced the response
    Respond(Response<Full<Bytes>>),
}

/// Security verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityVerdict {
    pub blocked: bool,
    pub reason: Option<String>,
}

impl SecurityVerdict {
    pub fn allow() -> Self {
        Self {
            blocked: false,
            reason: None,
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            blocked: true,
            reason: Some(reason.into()),
        }
    }
}

/// Read-only view of an inbound request
#[derive(Debug, Clone)]
pub struct EdgeRequest {
    pub method: Method,
    /// Routing hostname (lower-case, port stripped)
    pub hostname: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub client_ip: IpAddr,
}

impl EdgeRequest {
    /// Path plus `?query` when a non-empty query is present
    pub fn path_and_query(&self) -> String {
        match self.query.as_deref() {
            Some(q) if !q.is_empty() => format!("{}?{}", self.path, q),
            _ => self.path.clone(),
        }
    }

    /// Value of a header as a string, if present and valid
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Parameters passed to a content transform
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformParams {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub quality: Option<u8>,
    pub format: Option<String>,
    pub accept: Option<String>,
}

impl TransformParams {
    /// Parse `w`, `h`, `q` and `format` query parameters
    pub fn from_query(query: Option<&str>, accept: Option<&str>) -> Self {
        let mut params = Self {
            accept: accept.map(str::to_string),
            ..Self::default()
        };
        for pair in query.unwrap_or_default().split('&') {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            match name {
                "w" | "width" => params.width = value.parse().ok(),
                "h" | "height" => params.height = value.parse().ok(),
                "q" | "quality" => params.quality = value.parse().ok(),
                "format" if !value.is_empty() => params.format = Some(value.to_string()),
                _ => {}
            }
        }
        params
    }

    /// Whether the request asked for any transformation
    pub fn is_requested(&self) -> bool {
        self.width.is_some() || self.height.is_some() || self.quality.is_some() || self.format.is_some()
    }
}

/// Result of a successful content transform
#[derive(Debug, Clone)]
pub struct TransformOutput {
    pub body: Bytes,
    pub content_type: String,
}

/// Request classification recorded by analytics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestOutcome {
    Hit,
    Miss,
    Error,
    Blocked,
}

/// Routing form of a hostname: lower-case, no port
pub fn normalize_hostname(hostname: &str) -> String {
    let host = hostname.trim();
    let host = match host.strip_prefix('[') {
        // IPv6 literal, keep the brackets
        Some(rest) => match rest.find(']') {
            Some(end) => &host[..end + 2],
            None => host,
        },
        None => host.split(':').next().unwrap_or(host),
    };
    host.to_ascii_lowercase()
}

// =============================================================================
// Tenant Store Port
// =============================================================================

/// Domain to origin mapping.
///
/// Called synchronously on every request, so implementations keep the map
/// in memory.
pub trait TenantStore: Send + Sync {
    /// Origin URL for a hostname
    fn resolve_origin(&self, hostname: &str) -> Option<String> {
        self.get_config(hostname).map(|c| c.origin)
    }

    /// Full configuration for a hostname
    fn get_config(&self, hostname: &str) -> Option<TenantConfig>;

    /// Register or replace a domain
    fn add_domain(&self, hostname: &str, origin: &str, attrs: TenantAttrs) -> Result<()>;

    /// Remove a domain, returning whether it existed
    fn remove_domain(&self, hostname: &str) -> Result<bool>;

    /// Snapshot of every configured domain
    fn list_all(&self) -> BTreeMap<String, TenantConfig>;

    /// Re-read the backing store
    fn reload(&self) -> Result<()>;
}

// =============================================================================
// Security Filter Port
// =============================================================================

/// Request filter invoked before any cache or origin work
pub trait SecurityFilter: Send + Sync {
    fn check(&self, request: &EdgeRequest, tenant: &TenantConfig) -> SecurityVerdict;
}

// =============================================================================
// Extensibility Hook Port
// =============================================================================

/// Per-tenant rule executor
#[async_trait]
pub trait EdgeHook: Send + Sync {
    async fn run(&self, rule: &EdgeRule, request: &EdgeRequest, phase: HookPhase) -> HookOutcome;
}

// =============================================================================
// Content Transform Port
// =============================================================================

/// Body transformation (image resize/reformat and similar)
#[async_trait]
pub trait ContentTransform: Send + Sync {
    async fn transform(&self, body: Bytes, params: &TransformParams) -> Result<TransformOutput>;
}

// =============================================================================
// Traffic Recorder Port
// =============================================================================

/// Sink for per-request analytics
pub trait TrafficRecorder: Send + Sync {
    fn record_request(&self, outcome: RequestOutcome, hostname: &str);

    fn record_bandwidth(&self, bytes: u64, hostname: &str);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_config_defaults() {
        let config: TenantConfig =
            serde_json::from_str(r#"{"origin": "http://origin.test"}"#).unwrap();
        assert_eq!(config.origin, "http://origin.test");
        assert!(config.edge_rules.is_empty());
        assert_eq!(config.plan, "free");
    }

    #[test]
    fn test_edge_rule_kinds() {
        let rules: Vec<EdgeRule> = serde_json::from_str(
            r#"[
                {"type": "redirect", "from": "/old", "to": "/new"},
                {"type": "deny", "prefix": "/private"},
                {"type": "workerScript"}
            ]"#,
        )
        .unwrap();

        assert_eq!(
            rules[0],
            EdgeRule::Redirect {
                from: "/old".into(),
                to: "/new".into(),
                status: 302
            }
        );
        assert_eq!(rules[1], EdgeRule::Deny { prefix: "/private".into() });
        assert_eq!(rules[2], EdgeRule::Unsupported);
    }

    #[test]
    fn test_transform_params_from_query() {
        let params = TransformParams::from_query(Some("w=200&h=100&q=80&format=webp&x=1"), Some("image/webp"));
        assert_eq!(params.width, Some(200));
        assert_eq!(params.height, Some(100));
        assert_eq!(params.quality, Some(80));
        assert_eq!(params.format.as_deref(), Some("webp"));
        assert!(params.is_requested());

        assert!(!TransformParams::from_query(Some("page=2"), None).is_requested());
        assert!(!TransformParams::from_query(None, None).is_requested());
    }

    #[test]
    fn test_path_and_query() {
        let mut req = EdgeRequest {
            method: Method::GET,
            hostname: "example.com".into(),
            path: "/a".into(),
            query: Some("b=1".into()),
            headers: HeaderMap::new(),
            client_ip: IpAddr::from([127, 0, 0, 1]),
        };
        assert_eq!(req.path_and_query(), "/a?b=1");
        req.query = Some(String::new());
        assert_eq!(req.path_and_query(), "/a");
    }
}
