//! Per-process service context
//!
//! Everything a request handler touches lives here: cache tiers, admission
//! state, adapters, the invalidation bus. Each process builds one context;
//! tests build as many isolated contexts as they need.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::adapters::analytics::{process_stats_path, TrafficStats};
use crate::adapters::redis::{RedisConnector, RedisCounterStore, RedisHotTier, RedisTransport};
use crate::adapters::rules::BuiltinRules;
use crate::adapters::security::PatternFilter;
use crate::adapters::tenant_store::JsonTenantStore;
use crate::admission::{AdmissionControl, CounterStore};
use crate::bus::{BusTransport, InvalidationBus, LocalTransport};
use crate::cache::{CacheReaper, DurableTier, HotTier, InMemoryHotTier, TieredCache};
use crate::config::EdgeConfig;
use crate::domain::events::PurgeSelector;
use crate::domain::ports::{ContentTransform, EdgeHook, SecurityFilter, TenantStore};
use crate::error::Result;
use crate::proxy::compression::Compressor;
use crate::proxy::origin::OriginFetcher;
use crate::proxy::pipeline::ResponsePipeline;

/// Interval between analytics snapshots
pub const ANALYTICS_PERSIST_INTERVAL: Duration = Duration::from_secs(60);

/// Interval between tenant reloads when no shared bus is available
pub const TENANT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Shared state of one edge process
pub struct ServiceContext {
    pub config: EdgeConfig,
    /// Worker id, `None` for the primary or a standalone node
    pub worker: Option<usize>,
    pub cache: Arc<TieredCache>,
    pub admission: AdmissionControl,
    pub tenants: Arc<dyn TenantStore>,
    pub security: Arc<dyn SecurityFilter>,
    pub hooks: Arc<dyn EdgeHook>,
    pub origin: OriginFetcher,
    pub pipeline: ResponsePipeline,
    pub stats: Arc<TrafficStats>,
    pub bus: Arc<InvalidationBus>,
    shared_bus: bool,
}

impl ServiceContext {
    pub fn builder(config: EdgeConfig) -> ContextBuilder {
        ContextBuilder::new(config)
    }

    /// Evict locally, then tell every other process
    pub async fn purge(&self, selector: PurgeSelector) -> Result<usize> {
        let count = self.cache.evict(&selector).await?;
        if let Err(e) = self.bus.announce_purge(selector).await {
            tracing::warn!(error = %e, "Failed to broadcast purge");
        }
        Ok(count)
    }

    /// Tell every other process a tenant changed
    pub async fn tenants_changed(&self, hostname: &str) {
        if let Err(e) = self.bus.announce_config_change(hostname).await {
            tracing::warn!(%hostname, error = %e, "Failed to broadcast config change");
        }
    }

    /// Durable-tier sweeper over this context's cache directory
    pub fn reaper(&self) -> CacheReaper {
        CacheReaper::new(self.cache.durable().clone())
    }

    /// Write the analytics snapshot for this process, if configured
    pub async fn persist_stats(&self) {
        let Some(path) = &self.config.analytics_file else {
            return;
        };
        let path = process_stats_path(path, self.worker);
        if let Err(e) = self.stats.persist(&path).await {
            tracing::warn!(path = %path.display(), error = %e, "Failed to persist analytics");
        }
    }

    /// Start the bus subscription and periodic housekeeping
    pub async fn start_background(self: &Arc<Self>, shutdown: CancellationToken) {
        if let Err(e) = self.bus.start(shutdown.clone()).await {
            tracing::warn!(error = %e, "Invalidation bus unavailable, retrying in background");
            tokio::spawn(self.bus.clone().run(None, shutdown.clone()));
        }

        let ctx = self.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ANALYTICS_PERSIST_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {
                        ctx.persist_stats().await;
                        ctx.admission.prune();
                    }
                }
            }
        });

        // Workers without a shared bus pick up admin changes by polling
        if !self.shared_bus && self.worker.is_some() {
            let tenants = self.tenants.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(TENANT_REFRESH_INTERVAL);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = ticker.tick() => {
                            if let Err(e) = tenants.reload() {
                                tracing::warn!(error = %e, "Tenant reload failed");
                            }
                        }
                    }
                }
            });
        }
    }
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("worker", &self.worker)
            .field("bus", &self.bus)
            .field("shared_bus", &self.shared_bus)
            .finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`ServiceContext`]; unset parts come from the configuration
pub struct ContextBuilder {
    config: EdgeConfig,
    worker: Option<usize>,
    tenants: Option<Arc<dyn TenantStore>>,
    hot: Option<Arc<dyn HotTier>>,
    counters: Option<Arc<dyn CounterStore>>,
    transport: Option<Arc<dyn BusTransport>>,
    transform: Option<Arc<dyn ContentTransform>>,
}

impl ContextBuilder {
    fn new(config: EdgeConfig) -> Self {
        Self {
            config,
            worker: None,
            tenants: None,
            hot: None,
            counters: None,
            transport: None,
            transform: None,
        }
    }

    pub fn worker(mut self, id: usize) -> Self {
        self.worker = Some(id);
        self
    }

    pub fn tenants(mut self, tenants: Arc<dyn TenantStore>) -> Self {
        self.tenants = Some(tenants);
        self
    }

    pub fn hot_tier(mut self, hot: Arc<dyn HotTier>) -> Self {
        self.hot = Some(hot);
        self
    }

    pub fn counter_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.counters = Some(store);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn BusTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn transform(mut self, transform: Arc<dyn ContentTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub async fn build(self) -> Result<Arc<ServiceContext>> {
        let config = self.config;
        let redis = match &config.redis {
            Some(r) => Some(RedisConnector::new(&r.url, r.timeout)?),
            None => None,
        };

        // Without Redis, worker processes cannot invalidate each other's
        // memory, so they share the disk tier only.
        let hot: Option<Arc<dyn HotTier>> = match (self.hot, &redis) {
            (Some(hot), _) => Some(hot),
            (None, Some(redis)) => Some(Arc::new(RedisHotTier::new(redis.clone()))),
            (None, None) if self.worker.is_none() => Some(Arc::new(InMemoryHotTier::new())),
            (None, None) => None,
        };
        let durable = DurableTier::open(&config.cache.dir).await?;
        let cache = Arc::new(TieredCache::new(hot, durable));

        let counters = self
            .counters
            .or_else(|| redis.clone().map(|r| Arc::new(RedisCounterStore::new(r)) as Arc<dyn CounterStore>));
        let admission = match counters {
            Some(store) => AdmissionControl::with_store(config.admission.clone(), store),
            None => AdmissionControl::new(config.admission.clone()),
        };

        let shared_bus = self.transport.is_some() || redis.is_some();
        let transport: Arc<dyn BusTransport> = match (self.transport, &redis) {
            (Some(t), _) => t,
            (None, Some(redis)) => Arc::new(RedisTransport::new(redis.clone())),
            (None, None) => Arc::new(LocalTransport::new()),
        };

        let tenants: Arc<dyn TenantStore> = match (self.tenants, &config.domains_file) {
            (Some(t), _) => t,
            (None, Some(path)) => Arc::new(JsonTenantStore::open(path)?),
            (None, None) => Arc::new(JsonTenantStore::in_memory()),
        };

        let stats = Arc::new(match &config.analytics_file {
            Some(path) => TrafficStats::load(&process_stats_path(path, self.worker)),
            None => TrafficStats::new(),
        });

        let mut pipeline = ResponsePipeline::new(Compressor::new(config.compression.clone()), stats.clone());
        if let Some(transform) = self.transform {
            pipeline = pipeline.with_transform(transform);
        }

        let bus = Arc::new(InvalidationBus::new(transport));
        {
            let cache = cache.clone();
            bus.on_purge(move |selector| {
                let cache = cache.clone();
                async move {
                    if let Err(e) = cache.evict(&selector).await {
                        tracing::warn!(%selector, error = %e, "Remote purge failed locally");
                    }
                }
                .boxed()
            });
        }
        {
            let tenants = tenants.clone();
            bus.on_config_change(move |hostname| {
                let tenants = tenants.clone();
                async move {
                    if let Err(e) = tenants.reload() {
                        tracing::warn!(%hostname, error = %e, "Tenant reload failed");
                    }
                }
                .boxed()
            });
        }

        let origin = OriginFetcher::new(config.origin.clone())?;

        Ok(Arc::new(ServiceContext {
            worker: self.worker,
            cache,
            admission,
            tenants,
            security: Arc::new(PatternFilter::new()),
            hooks: Arc::new(BuiltinRules::new()),
            origin,
            pipeline,
            stats,
            bus,
            shared_bus,
            config,
        }))
    }
}

// =============================================================================
// Tests
// =============================================================================
