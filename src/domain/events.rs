//! Domain Events
//!
//! Events broadcast between cooperating edge processes over the
//! invalidation bus. Events are ephemeral: never persisted, delivered
//! at-least-once to every subscriber.

use serde::{Deserialize, Serialize};

use crate::domain::ports::normalize_hostname;
use crate::error::{Error, Result};

/// Which cache entries a purge targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "scope")]
pub enum PurgeSelector {
    /// Every entry in every tier
    All,
    /// One resource of one tenant
    Resource {
        hostname: String,
        /// Request target (path plus optional `?query`)
        path: String,
    },
}

impl PurgeSelector {
    /// Selector for a single resource; the hostname is reduced to its
    /// routing form so it matches the keys requests are cached under
    pub fn resource(hostname: impl AsRef<str>, path: impl Into<String>) -> Self {
        Self::Resource {
            hostname: normalize_hostname(hostname.as_ref()),
            path: path.into(),
        }
    }

    /// Build a selector from the purge endpoint parameters.
    ///
    /// `target` is `all`, a request path, or a full `http(s)://` URL. An
    /// explicit `domain` wins over the URL's hostname; the URL always
    /// supplies the path and query.
    pub fn parse(target: Option<&str>, domain: Option<&str>) -> Result<Self> {
        let target = target.map(str::trim).filter(|t| !t.is_empty()).unwrap_or("all");
        if target == "all" {
            return Ok(Self::All);
        }

        let mut hostname = domain
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string);
        let mut path = target.to_string();

        if target.starts_with("http://") || target.starts_with("https://") {
            if let Ok(url) = reqwest::Url::parse(target) {
                if hostname.is_none() {
                    hostname = url.host_str().map(str::to_string);
                }
                path = match url.query() {
                    Some(q) => format!("{}?{}", url.path(), q),
                    None => url.path().to_string(),
                };
            }
        }

        match hostname {
            Some(hostname) => Ok(Self::resource(hostname, path)),
            None => Err(Error::InvalidPurgeTarget(
                "Domain or full URL is required to purge specific cache item.".into(),
            )),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }
}

impl std::fmt::Display for PurgeSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Resource { hostname, path } => write!(f, "{}{}", hostname, path),
        }
    }
}

/// Event carried by the invalidation bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EdgeEvent {
    /// Cache entries were purged by some process
    Purge { selector: PurgeSelector },
    /// Tenant configuration changed; processes reload their store
    ConfigChanged { hostname: String },
}

// =============================================================================
// Tests
// =============================================================================
