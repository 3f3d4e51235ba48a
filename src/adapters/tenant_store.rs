//! JSON Tenant Store Adapter
//!
//! Implements the `TenantStore` port over a JSON file mapping hostnames to
//! tenant configuration. The map is held in memory; mutations are written
//! back to the file immediately. Hostnames are case-insensitive.
//!
//! Accepted file format:
//!
//! ```json
//! {
//!   "shop.example.com": { "origin": "https://origin.example.com", "plan": "pro" },
//!   "blog.example.com": "http://10.0.0.5:8080"
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::Deserialize;

use crate::domain::ports::normalize_hostname as normalize;
use crate::domain::ports::{TenantAttrs, TenantConfig, TenantStore};
use crate::error::{Error, Result};

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredTenant {
    Origin(String),
    Config(TenantConfig),
}

impl From<StoredTenant> for TenantConfig {
    fn from(stored: StoredTenant) -> Self {
        match stored {
            StoredTenant::Origin(origin) => TenantConfig::new(origin),
            StoredTenant::Config(config) => config,
        }
    }
}

/// File-backed tenant store
#[derive(Debug)]
pub struct JsonTenantStore {
    path: Option<PathBuf>,
    domains: RwLock<BTreeMap<String, TenantConfig>>,
}

impl JsonTenantStore {
    /// Open the store at `path`; a missing file is an empty store
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let domains = read_file(&path)?;
        tracing::info!(path = %path.display(), domains = domains.len(), "Loaded tenant store");
        Ok(Self {
            path: Some(path),
            domains: RwLock::new(domains),
        })
    }

    /// Store that lives only in memory
    pub fn in_memory() -> Self {
        Self {
            path: None,
            domains: RwLock::new(BTreeMap::new()),
        }
    }

    /// Builder-style registration for tests and bootstrap
    pub fn with_domain(self, hostname: &str, config: TenantConfig) -> Self {
        self.domains.write().insert(normalize(hostname), config);
        self
    }

    fn save(&self, domains: &BTreeMap<String, TenantConfig>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(domains)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

impl TenantStore for JsonTenantStore {
    fn get_config(&self, hostname: &str) -> Option<TenantConfig> {
        self.domains.read().get(&normalize(hostname)).cloned()
    }

    fn add_domain(&self, hostname: &str, origin: &str, attrs: TenantAttrs) -> Result<()> {
        let hostname = normalize(hostname);
        if hostname.is_empty() {
            return Err(Error::Config("hostname must not be empty".into()));
        }
        let parsed = reqwest::Url::parse(origin)
            .map_err(|e| Error::Config(format!("invalid origin {}: {}", origin, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::Config(format!("origin {} must be http or https", origin)));
        }

        let mut config = TenantConfig::new(origin);
        config.edge_rules = attrs.edge_rules;
        if let Some(plan) = attrs.plan {
            config.plan = plan;
        }

        let mut domains = self.domains.write();
        domains.insert(hostname.clone(), config);
        self.save(&domains)?;
        tracing::info!(%hostname, %origin, "Domain added");
        Ok(())
    }

    fn remove_domain(&self, hostname: &str) -> Result<bool> {
        let hostname = normalize(hostname);
        let mut domains = self.domains.write();
        if domains.remove(&hostname).is_none() {
            return Ok(false);
        }
        self.save(&domains)?;
        tracing::info!(%hostname, "Domain removed");
        Ok(true)
    }

    fn list_all(&self) -> BTreeMap<String, TenantConfig> {
        self.domains.read().clone()
    }

    fn reload(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let fresh = read_file(path)?;
        tracing::debug!(domains = fresh.len(), "Reloaded tenant store");
        *self.domains.write() = fresh;
        Ok(())
    }
}

fn read_file(path: &Path) -> Result<BTreeMap<String, TenantConfig>> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };
    let stored: BTreeMap<String, StoredTenant> = serde_json::from_slice(&raw)
        .map_err(|e| Error::Config(format!("invalid domains file {}: {}", path.display(), e)))?;
    Ok(stored
        .into_iter()
        .map(|(host, tenant)| (normalize(&host), tenant.into()))
        .collect())
}

// =============================================================================
// Tests
// =============================================================================
