//! Tiered Cache - hot + durable read/write/evict protocol
//!
//! Reads go hot tier first, then durable tier; a durable hit repopulates the
//! hot tier in a detached task. Writes go durable tier first so a successful
//! `put` survives a hot-tier failure. The durable tier is authoritative for
//! validity.
//!
//! No tier failure ever reaches the request path: hot-tier errors degrade to
//! "absent" / "durable only", durable-tier errors degrade to a miss.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::durable::{DurableLookup, DurableTier};
use super::entry::CacheEntry;
use super::hot::HotTier;
use super::key::CacheKey;
use super::metrics::CacheMetrics;
use crate::admission::LogThrottle;
use crate::domain::events::PurgeSelector;
use crate::error::Result;

/// Cache tier enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    /// Fast volatile tier
    Hot,
    /// On-disk tier
    Durable,
}

impl CacheTier {
    /// Label used in the `X-Cache: HIT-<tier>` header
    pub fn label(&self) -> &'static str {
        match self {
            CacheTier::Hot => "HOT",
            CacheTier::Durable => "DISK",
        }
    }
}

impl std::fmt::Display for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Cache lookup result
#[derive(Debug)]
pub struct CacheResult {
    /// The cached entry
    pub entry: CacheEntry,
    /// Which tier the entry was found in
    pub tier: CacheTier,
    /// Lookup latency
    pub latency: Duration,
}

impl CacheResult {
    /// Value of the `X-Cache` diagnostic header
    pub fn cache_status(&self) -> String {
        format!("HIT-{}", self.tier.label())
    }
}

/// Unified two-tier cache
pub struct TieredCache {
    /// Fast tier (absent when running durable-only)
    hot: Option<Arc<dyn HotTier>>,
    /// Authoritative on-disk tier
    durable: DurableTier,
    /// Metrics collector
    metrics: Arc<CacheMetrics>,
    /// Hot-tier error log limiter
    hot_errors: Arc<LogThrottle>,
}

impl TieredCache {
    /// Create a tiered cache
    pub fn new(hot: Option<Arc<dyn HotTier>>, durable: DurableTier) -> Self {
        Self {
            hot,
            durable,
            metrics: Arc::new(CacheMetrics::new()),
            hot_errors: Arc::new(LogThrottle::default()),
        }
    }

    /// Create a durable-only cache (no hot tier)
    pub fn durable_only(durable: DurableTier) -> Self {
        Self::new(None, durable)
    }

    /// Get an entry (hot tier, then durable tier)
    pub async fn get(&self, key: &CacheKey) -> Option<CacheResult> {
        let start = Instant::now();

        if let Some(hot) = &self.hot {
            match hot.get(key).await {
                Ok(Some(entry)) => {
                    self.metrics.record_hot_hit();
                    return Some(CacheResult {
                        entry,
                        tier: CacheTier::Hot,
                        latency: start.elapsed(),
                    });
                }
                Ok(None) => self.metrics.record_hot_miss(),
                Err(e) => {
                    self.metrics.record_hot_miss();
                    self.metrics.record_hot_error();
                    if self.hot_errors.should_log() {
                        tracing::error!(tier = hot.name(), error = %e, "Hot tier read error (throttled)");
                    }
                }
            }
        }

        let lookup = match self.durable.read(key).await {
            Ok(lookup) => lookup,
            Err(e) => {
                tracing::error!(key = %key, error = %e, "Cache read error");
                self.metrics.record_durable_miss();
                return None;
            }
        };

        match lookup {
            DurableLookup::Fresh(entry) => {
                self.metrics.record_durable_hit();
                self.repopulate_hot(&entry);
                Some(CacheResult {
                    entry,
                    tier: CacheTier::Durable,
                    latency: start.elapsed(),
                })
            }
            DurableLookup::Expired => {
                tracing::debug!(key = %key, "Cache stale");
                self.metrics.record_durable_miss();
                self.drop_durable(key).await;
                None
            }
            DurableLookup::Corrupt(reason) => {
                tracing::warn!(key = %key, reason = %reason, "Corrupt cache record, removing");
                self.metrics.record_durable_miss();
                self.drop_durable(key).await;
                None
            }
            DurableLookup::Missing => {
                self.metrics.record_durable_miss();
                None
            }
        }
    }

    /// Store an entry in both tiers (durable first)
    pub async fn put(&self, entry: CacheEntry, ttl: Duration) -> Result<()> {
        self.durable.write(&entry).await?;
        self.metrics.record_write(entry.size() as u64);

        if let Some(hot) = &self.hot {
            if let Err(e) = hot.set(&entry, ttl).await {
                self.metrics.record_hot_error();
                if self.hot_errors.should_log() {
                    tracing::error!(tier = hot.name(), error = %e, "Hot tier write error (throttled)");
                }
            }
        }
        Ok(())
    }

    /// Remove entries matching `selector` from both tiers.
    ///
    /// For a single resource the count is the number of tiers that held the
    /// entry (0, 1 or 2). For `All` it is the number of durable files removed.
    pub async fn evict(&self, selector: &PurgeSelector) -> Result<usize> {
        match selector {
            PurgeSelector::All => {
                let removed = self.durable.clear().await?;
                if let Some(hot) = &self.hot {
                    if let Err(e) = hot.flush().await {
                        tracing::error!(tier = hot.name(), error = %e, "Hot tier flush failed");
                    }
                }
                self.metrics.record_evictions(removed as u64);
                tracing::info!(removed, "Purged entire cache");
                Ok(removed)
            }
            PurgeSelector::Resource { hostname, path } => {
                let key = CacheKey::derive(hostname, path);
                let mut count = 0;

                // A durable failure must not keep the hot copy alive
                match self.durable.delete(&key).await {
                    Ok(true) => count += 1,
                    Ok(false) => {}
                    Err(e) => tracing::error!(%hostname, %path, error = %e, "Durable tier delete failed"),
                }
                if let Some(hot) = &self.hot {
                    match hot.delete(&key).await {
                        Ok(true) => count += 1,
                        Ok(false) => {}
                        Err(e) => {
                            tracing::error!(tier = hot.name(), error = %e, "Hot tier delete failed")
                        }
                    }
                }
                self.metrics.record_evictions(count as u64);
                tracing::info!(%hostname, %path, count, "Purged cache entry");
                Ok(count)
            }
        }
    }

    /// Spawn a detached hot-tier write for a durable hit
    fn repopulate_hot(&self, entry: &CacheEntry) {
        let Some(hot) = self.hot.clone() else {
            return;
        };
        let Some(ttl) = entry.remaining_ttl() else {
            return;
        };

        let entry = entry.clone();
        let metrics = self.metrics.clone();
        let throttle = self.hot_errors.clone();
        tokio::spawn(async move {
            match hot.set(&entry, ttl).await {
                Ok(()) => metrics.record_promotion(),
                Err(e) => {
                    metrics.record_hot_error();
                    if throttle.should_log() {
                        tracing::warn!(key = %entry.key, error = %e, "Hot tier repopulation failed (throttled)");
                    }
                }
            }
        });
    }

    async fn drop_durable(&self, key: &CacheKey) {
        if let Err(e) = self.durable.delete(key).await {
            tracing::warn!(key = %key, error = %e, "Failed to remove stale cache record");
        }
    }

    /// Get reference to the hot tier
    pub fn hot(&self) -> Option<&Arc<dyn HotTier>> {
        self.hot.as_ref()
    }

    /// Get reference to the durable tier
    pub fn durable(&self) -> &DurableTier {
        &self.durable
    }

    /// Get metrics collector
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::durable::tests::temp_cache_dir;
    use crate::cache::entry::HeaderMap;
    use crate::cache::hot::InMemoryHotTier;
    use crate::error::Error;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::Utc;

    fn make_entry(host: &str, path: &str, body: &[u8]) -> CacheEntry {
        let mut headers = HeaderMap::new();
        headers.insert("content-type".into(), "text/plain".into());
        headers.insert("etag".into(), "\"v1\"".into());
        CacheEntry::new(
            CacheKey::derive(host, path),
            path,
            headers,
            Bytes::copy_from_slice(body),
            Duration::from_secs(120),
        )
    }

    async fn make_cache() -> (TieredCache, Arc<InMemoryHotTier>) {
        let hot = Arc::new(InMemoryHotTier::new());
        let durable = DurableTier::open(temp_cache_dir()).await.unwrap();
        (TieredCache::new(Some(hot.clone()), durable), hot)
    }

    /// Hot tier whose every call fails, standing in for an unreachable Redis
    struct BrokenHotTier;

    #[async_trait]
    impl HotTier for BrokenHotTier {
        fn name(&self) -> &'static str {
            "broken"
        }
        async fn get(&self, _key: &CacheKey) -> Result<Option<CacheEntry>> {
            Err(Error::BackingStoreDegraded("connection refused".into()))
        }
        async fn set(&self, _entry: &CacheEntry, _ttl: Duration) -> Result<()> {
            Err(Error::BackingStoreDegraded("connection refused".into()))
        }
        async fn delete(&self, _key: &CacheKey) -> Result<bool> {
            Err(Error::BackingStoreDegraded("connection refused".into()))
        }
        async fn flush(&self) -> Result<()> {
            Err(Error::BackingStoreDegraded("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_put_then_get_is_identical() {
        let (cache, _) = make_cache().await;
        let entry = make_entry("example.com", "/a.txt", b"hello world");

        cache.put(entry.clone(), Duration::from_secs(120)).await.unwrap();

        let result = cache.get(&entry.key).await.unwrap();
        assert_eq!(result.tier, CacheTier::Hot);
        assert_eq!(result.entry.body, entry.body);
        assert_eq!(result.entry.headers, entry.headers);
        assert_eq!(result.cache_status(), "HIT-HOT");
    }

    #[tokio::test]
    async fn test_durable_hit_repopulates_hot() {
        let (cache, hot) = make_cache().await;
        let entry = make_entry("example.com", "/disk", b"from disk");
        cache.durable().write(&entry).await.unwrap();

        let result = cache.get(&entry.key).await.unwrap();
        assert_eq!(result.tier, CacheTier::Durable);
        assert_eq!(result.entry.body, entry.body);

        // Repopulation is detached; give it a moment
        for _ in 0..50 {
            if hot.get(&entry.key).await.unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let result = cache.get(&entry.key).await.unwrap();
        assert_eq!(result.tier, CacheTier::Hot);
    }

    #[tokio::test]
    async fn test_expired_durable_entry_is_removed_on_read() {
        let (cache, _) = make_cache().await;
        let mut entry = make_entry("example.com", "/stale", b"old");
        entry.expires_at = Utc::now() - chrono::Duration::seconds(1);
        cache.durable().write(&entry).await.unwrap();

        assert!(cache.get(&entry.key).await.is_none());
        assert!(!cache.durable().meta_path(&entry.key).exists());
        assert!(!cache.durable().body_path(&entry.key).exists());
    }

    #[tokio::test]
    async fn test_corrupt_durable_entry_is_a_miss() {
        let (cache, _) = make_cache().await;
        let entry = make_entry("example.com", "/corrupt", b"x");
        cache.durable().write(&entry).await.unwrap();
        tokio::fs::write(cache.durable().meta_path(&entry.key), b"garbage")
            .await
            .unwrap();

        assert!(cache.get(&entry.key).await.is_none());
        assert!(!cache.durable().body_path(&entry.key).exists());
    }

    #[tokio::test]
    async fn test_broken_hot_tier_degrades_to_durable() {
        let durable = DurableTier::open(temp_cache_dir()).await.unwrap();
        let cache = TieredCache::new(Some(Arc::new(BrokenHotTier)), durable);
        let entry = make_entry("example.com", "/x", b"still served");

        cache.put(entry.clone(), Duration::from_secs(60)).await.unwrap();
        let result = cache.get(&entry.key).await.unwrap();
        assert_eq!(result.tier, CacheTier::Durable);
        assert_eq!(result.entry.body, entry.body);
        assert!(cache.metrics().hot_errors() >= 2);

        let count = cache
            .evict(&PurgeSelector::resource("example.com", "/x"))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_evict_resource_counts_tiers() {
        let (cache, _) = make_cache().await;
        let entry = make_entry("example.com", "/page?x=1", b"body");
        cache.put(entry.clone(), Duration::from_secs(60)).await.unwrap();

        let selector = PurgeSelector::resource("example.com", "/page?x=1");
        assert_eq!(cache.evict(&selector).await.unwrap(), 2);
        assert_eq!(cache.evict(&selector).await.unwrap(), 0);
        assert!(cache.get(&entry.key).await.is_none());
    }

    #[tokio::test]
    async fn test_durable_delete_failure_still_clears_hot() {
        let (cache, hot) = make_cache().await;
        let entry = make_entry("example.com", "/stuck", b"body");
        cache.put(entry.clone(), Duration::from_secs(60)).await.unwrap();

        // A directory where the body file was makes the durable delete fail
        let body = cache.durable().body_path(&entry.key);
        tokio::fs::remove_file(&body).await.unwrap();
        tokio::fs::create_dir(&body).await.unwrap();
        assert!(cache.durable().delete(&entry.key).await.is_err());

        let count = cache
            .evict(&PurgeSelector::resource("example.com", "/stuck"))
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert!(hot.is_empty());
    }

    #[tokio::test]
    async fn test_evict_all() {
        let (cache, hot) = make_cache().await;
        let mut keys = Vec::new();
        for i in 0..5 {
            let entry = make_entry("example.com", &format!("/{}", i), b"data");
            keys.push(entry.key);
            cache.put(entry, Duration::from_secs(60)).await.unwrap();
        }

        let removed = cache.evict(&PurgeSelector::All).await.unwrap();
        assert_eq!(removed, 10);
        assert!(hot.is_empty());
        for key in keys {
            assert!(cache.get(&key).await.is_none());
        }
    }

    #[tokio::test]
    async fn test_durable_only_cache() {
        let durable = DurableTier::open(temp_cache_dir()).await.unwrap();
        let cache = TieredCache::durable_only(durable);
        let entry = make_entry("example.com", "/only", b"disk");

        cache.put(entry.clone(), Duration::from_secs(60)).await.unwrap();
        let result = cache.get(&entry.key).await.unwrap();
        assert_eq!(result.tier, CacheTier::Durable);
        assert_eq!(result.cache_status(), "HIT-DISK");
    }
}
