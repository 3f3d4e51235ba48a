//! Admission Control
//!
//! Fixed-window rate limiting per client identity. The counter lives in a
//! shared store (Redis) when one is configured; when the store is absent or
//! failing, an in-process window map takes over. The fallback is per
//! process, so during a store outage the effective limit is multiplied by
//! the number of workers.
//!
//! Windows are fixed, not sliding: a client may burst up to `2 × max`
//! requests across a window boundary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;

/// Default window (15 minutes)
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(15 * 60 * 1000);

/// Default requests per window
pub const DEFAULT_MAX_REQUESTS: u64 = 100;

/// Default interval between repeated backing-store error logs
pub const DEFAULT_LOG_THROTTLE: Duration = Duration::from_secs(60);

/// Admission control configuration
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Window length
    pub window: Duration,
    /// Requests admitted per identity per window
    pub max_requests: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            max_requests: DEFAULT_MAX_REQUESTS,
        }
    }
}

// =============================================================================
// Log Throttle
// =============================================================================

/// Allows a log line at most once per interval
#[derive(Debug)]
pub struct LogThrottle {
    interval_ms: u64,
    origin: Instant,
    /// Milliseconds since `origin` of the last permitted log, plus one
    last: AtomicU64,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            origin: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    /// Whether the caller may log now; claims the slot if so
    pub fn should_log(&self) -> bool {
        let now = self.origin.elapsed().as_millis() as u64 + 1;
        let last = self.last.load(Ordering::Relaxed);
        if last != 0 && now.saturating_sub(last) < self.interval_ms {
            return false;
        }
        self.last
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

impl Default for LogThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_THROTTLE)
    }
}

// =============================================================================
// Shared Counter Store
// =============================================================================

/// Shared counter backend for distributed rate limiting
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment the counter for `key`, setting its expiry to
    /// `window` on first increment; returns the new count.
    async fn increment(&self, key: &str, window: Duration) -> Result<u64>;
}

// =============================================================================
// Admission Control
// =============================================================================

/// Fixed-window counter for one identity
#[derive(Debug, Clone, Copy)]
pub struct RateLimitWindow {
    pub window_start: Instant,
    pub count: u64,
}

/// Per-process admission gate
pub struct AdmissionControl {
    config: AdmissionConfig,
    store: Option<Arc<dyn CounterStore>>,
    local: DashMap<String, RateLimitWindow>,
    throttle: LogThrottle,
}

impl AdmissionControl {
    /// Local-only admission control
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            store: None,
            local: DashMap::new(),
            throttle: LogThrottle::default(),
        }
    }

    /// Admission control backed by a shared counter store
    pub fn with_store(config: AdmissionConfig, store: Arc<dyn CounterStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::new(config)
        }
    }

    /// Decide whether a request from `identity` is admitted
    pub async fn admit(&self, identity: &str) -> bool {
        if let Some(store) = &self.store {
            let key = format!("ratelimit:{}", identity);
            match store.increment(&key, self.config.window).await {
                Ok(count) => return count <= self.config.max_requests,
                Err(e) => {
                    if self.throttle.should_log() {
                        tracing::error!(error = %e, "Rate-limit store unavailable, using local window (throttled)");
                    }
                }
            }
        }
        self.admit_local_at(identity, Instant::now())
    }

    /// Local fixed-window decision at a given instant
    pub fn admit_local_at(&self, identity: &str, now: Instant) -> bool {
        let mut slot = self
            .local
            .entry(identity.to_string())
            .or_insert(RateLimitWindow {
                window_start: now,
                count: 0,
            });

        if now.saturating_duration_since(slot.window_start) > self.config.window {
            slot.window_start = now;
            slot.count = 0;
        }
        slot.count += 1;
        slot.count <= self.config.max_requests
    }

    /// Drop local windows that have fully elapsed
    pub fn prune(&self) {
        let now = Instant::now();
        let window = self.config.window;
        self.local
            .retain(|_, w| now.saturating_duration_since(w.window_start) <= window);
    }

    /// Number of identities tracked locally
    pub fn tracked(&self) -> usize {
        self.local.len()
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct FailingStore;

    #[async_trait]
    impl CounterStore for FailingStore {
        async fn increment(&self, _key: &str, _window: Duration) -> Result<u64> {
            Err(Error::BackingStoreDegraded("connection refused".into()))
        }
    }

    #[derive(Default)]
    struct MapStore {
        counts: Mutex<HashMap<String, u64>>,
    }

    #[async_trait]
    impl CounterStore for MapStore {
        async fn increment(&self, key: &str, _window: Duration) -> Result<u64> {
            let mut counts = self.counts.lock();
            let count = counts.entry(key.to_string()).or_insert(0);
            *count += 1;
            Ok(*count)
        }
    }

    #[test]
    fn test_exactly_max_admitted_then_reset() {
        let ac = AdmissionControl::new(AdmissionConfig::default());
        let start = Instant::now();

        for i in 0..100 {
            assert!(ac.admit_local_at("10.0.0.1", start), "request {} rejected", i + 1);
        }
        assert!(!ac.admit_local_at("10.0.0.1", start));

        // Still inside the window at exactly window_ms
        assert!(!ac.admit_local_at("10.0.0.1", start + DEFAULT_WINDOW));

        // New window once elapsed
        let later = start + DEFAULT_WINDOW + Duration::from_millis(1);
        assert!(ac.admit_local_at("10.0.0.1", later));
    }

    #[test]
    fn test_identities_are_independent() {
        let ac = AdmissionControl::new(AdmissionConfig {
            window: Duration::from_secs(60),
            max_requests: 1,
        });
        let now = Instant::now();
        assert!(ac.admit_local_at("a", now));
        assert!(!ac.admit_local_at("a", now));
        assert!(ac.admit_local_at("b", now));
        assert_eq!(ac.tracked(), 2);
    }

    #[tokio::test]
    async fn test_store_path() {
        let ac = AdmissionControl::with_store(
            AdmissionConfig {
                window: Duration::from_secs(60),
                max_requests: 2,
            },
            Arc::new(MapStore::default()),
        );
        assert!(ac.admit("c").await);
        assert!(ac.admit("c").await);
        assert!(!ac.admit("c").await);
        // Store handled it; no local window
        assert_eq!(ac.tracked(), 0);
    }

    #[tokio::test]
    async fn test_failing_store_falls_back_to_local() {
        let ac = AdmissionControl::with_store(
            AdmissionConfig {
                window: Duration::from_secs(60),
                max_requests: 3,
            },
            Arc::new(FailingStore),
        );
        for _ in 0..3 {
            assert!(ac.admit("d").await);
        }
        assert!(!ac.admit("d").await);
        assert_eq!(ac.tracked(), 1);
    }

    #[test]
    fn test_log_throttle() {
        let throttle = LogThrottle::new(Duration::from_secs(60));
        assert!(throttle.should_log());
        assert!(!throttle.should_log());
        assert!(!throttle.should_log());

        let eager = LogThrottle::new(Duration::ZERO);
        assert!(eager.should_log());
        assert!(eager.should_log());
    }
}
