//! Redis Adapters
//!
//! One Redis deployment can back three concerns at once:
//!
//! - [`RedisHotTier`] - hot cache tier, keys `meta:<hex>` and `body:<hex>`
//! - [`RedisCounterStore`] - shared fixed-window rate-limit counters
//! - [`RedisTransport`] - pub/sub transport for the invalidation bus
//!
//! Connections are opened lazily on first use, so the node starts (and
//! serves from disk) while Redis is down. Every command is bounded by a
//! timeout; a slow Redis is treated as an unavailable one.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;

use crate::admission::CounterStore;
use crate::bus::{BusStream, BusTransport};
use crate::cache::entry::{CacheEntry, EntryMetadata};
use crate::cache::hot::HotTier;
use crate::cache::key::CacheKey;
use crate::error::{Error, Result};

/// Pub/sub channel carrying bus events
pub const INVALIDATION_CHANNEL: &str = "pravah:invalidation";

/// Default per-command timeout
pub const DEFAULT_REDIS_TIMEOUT: Duration = Duration::from_millis(250);

// =============================================================================
// Connector
// =============================================================================

/// Lazily connected, auto-reconnecting Redis handle shared by the adapters
pub struct RedisConnector {
    client: redis::Client,
    manager: OnceCell<ConnectionManager>,
    timeout: Duration,
}

impl std::fmt::Debug for RedisConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConnector")
            .field("connected", &self.manager.initialized())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RedisConnector {
    /// Validate the URL; no connection is made yet
    pub fn new(url: &str, timeout: Duration) -> Result<Arc<Self>> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Config(format!("invalid Redis URL: {}", e)))?;
        Ok(Arc::new(Self {
            client,
            manager: OnceCell::new(),
            timeout,
        }))
    }

    /// Shared multiplexed connection, connecting on first use
    async fn connection(&self) -> Result<ConnectionManager> {
        let manager = self
            .manager
            .get_or_try_init(|| async {
                bounded(self.timeout * 4, self.client.get_connection_manager()).await
            })
            .await?;
        Ok(manager.clone())
    }

    /// Run a command future under the configured timeout
    async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        bounded(self.timeout, fut).await
    }
}

async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(Error::from),
        Err(_) => Err(Error::BackingStoreDegraded(format!(
            "Redis command timed out after {:?}",
            timeout
        ))),
    }
}

// =============================================================================
// Hot Tier
// =============================================================================

/// Redis-backed hot cache tier
pub struct RedisHotTier {
    redis: Arc<RedisConnector>,
}

impl RedisHotTier {
    pub fn new(redis: Arc<RedisConnector>) -> Self {
        Self { redis }
    }

    fn keys(key: &CacheKey) -> (String, String) {
        let hex = key.to_hex();
        (format!("meta:{}", hex), format!("body:{}", hex))
    }
}

#[async_trait]
impl HotTier for RedisHotTier {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let mut conn = self.redis.connection().await?;
        let (meta_key, body_key) = Self::keys(key);

        let (meta, body): (Option<String>, Option<Vec<u8>>) = self
            .redis
            .run(
                redis::pipe()
                    .atomic()
                    .get(&meta_key)
                    .get(&body_key)
                    .query_async(&mut conn),
            )
            .await?;

        // Both halves or nothing
        let (Some(meta), Some(body)) = (meta, body) else {
            return Ok(None);
        };
        let metadata: EntryMetadata = match serde_json::from_str(&meta) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Unreadable hot-tier metadata");
                return Ok(None);
            }
        };
        Ok(Some(CacheEntry::from_parts(*key, metadata, Bytes::from(body))))
    }

    async fn set(&self, entry: &CacheEntry, ttl: Duration) -> Result<()> {
        let ttl_secs = ttl.as_secs().max(1);
        let meta = serde_json::to_string(&entry.metadata())?;
        let (meta_key, body_key) = Self::keys(&entry.key);
        let mut conn = self.redis.connection().await?;

        let () = self
            .redis
            .run(
                redis::pipe()
                    .atomic()
                    .cmd("SET")
                    .arg(&meta_key)
                    .arg(meta)
                    .arg("EX")
                    .arg(ttl_secs)
                    .ignore()
                    .cmd("SET")
                    .arg(&body_key)
                    .arg(entry.body.as_ref())
                    .arg("EX")
                    .arg(ttl_secs)
                    .ignore()
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        let (meta_key, body_key) = Self::keys(key);
        let mut conn = self.redis.connection().await?;
        let removed: i64 = self
            .redis
            .run(redis::cmd("DEL").arg(&meta_key).arg(&body_key).query_async(&mut conn))
            .await?;
        Ok(removed > 0)
    }

    async fn flush(&self) -> Result<()> {
        let mut conn = self.redis.connection().await?;
        let () = self
            .redis
            .run(redis::cmd("FLUSHDB").query_async(&mut conn))
            .await?;
        Ok(())
    }
}

// =============================================================================
// Rate-limit Counters
// =============================================================================

/// Redis-backed shared counter store
pub struct RedisCounterStore {
    redis: Arc<RedisConnector>,
}

impl RedisCounterStore {
    pub fn new(redis: Arc<RedisConnector>) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<u64> {
        let mut conn = self.redis.connection().await?;
        let count: u64 = self
            .redis
            .run(redis::cmd("INCR").arg(key).query_async(&mut conn))
            .await?;
        if count == 1 {
            let () = self
                .redis
                .run(
                    redis::cmd("PEXPIRE")
                        .arg(key)
                        .arg(window.as_millis() as u64)
                        .query_async(&mut conn),
                )
                .await?;
        }
        Ok(count)
    }
}

// =============================================================================
// Bus Transport
// =============================================================================

/// Redis pub/sub transport for the invalidation bus
pub struct RedisTransport {
    redis: Arc<RedisConnector>,
    channel: String,
}

impl RedisTransport {
    pub fn new(redis: Arc<RedisConnector>) -> Self {
        Self {
            redis,
            channel: INVALIDATION_CHANNEL.to_string(),
        }
    }
}

#[async_trait]
impl BusTransport for RedisTransport {
    async fn publish(&self, payload: String) -> Result<()> {
        let mut conn = self.redis.connection().await?;
        let receivers: i64 = self
            .redis
            .run(
                redis::cmd("PUBLISH")
                    .arg(&self.channel)
                    .arg(payload)
                    .query_async(&mut conn),
            )
            .await?;
        tracing::trace!(receivers, channel = %self.channel, "Published bus event");
        Ok(())
    }

    async fn subscribe(&self) -> Result<BusStream> {
        let mut pubsub = bounded(self.redis.timeout * 4, self.redis.client.get_async_pubsub()).await?;
        bounded(self.redis.timeout * 4, pubsub.subscribe(&self.channel)).await?;

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() });
        Ok(Box::pin(stream))
    }
}

// =============================================================================
// Tests
// =============================================================================
