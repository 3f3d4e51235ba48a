//! Hot Tier - fast, volatile cache layer
//!
//! The hot tier is consulted before the durable tier. It may lag behind or
//! lose entries at any time; read-through from the durable tier repopulates
//! it. Two implementations exist: an in-process map (this module) and a
//! networked Redis store (`adapters::redis`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::entry::CacheEntry;
use super::key::CacheKey;
use crate::error::Result;

/// Default in-process hot tier capacity (256MB)
pub const DEFAULT_HOT_CAPACITY: u64 = 256 * 1024 * 1024;

/// Hot tier storage backend
#[async_trait]
pub trait HotTier: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Read an entry; headers and body are returned together or not at all
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;

    /// Store an entry that expires after `ttl`
    async fn set(&self, entry: &CacheEntry, ttl: Duration) -> Result<()>;

    /// Remove an entry, returning whether anything was removed
    async fn delete(&self, key: &CacheKey) -> Result<bool>;

    /// Drop the entire keyspace
    async fn flush(&self) -> Result<()>;
}

struct Slot {
    entry: CacheEntry,
    deadline: Instant,
}

/// In-process hot tier backed by a sharded concurrent map
pub struct InMemoryHotTier {
    slots: DashMap<CacheKey, Slot>,
    capacity: u64,
    current_size: AtomicU64,
}

impl InMemoryHotTier {
    /// Create a hot tier with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HOT_CAPACITY)
    }

    /// Create a hot tier bounded to `capacity` body bytes
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            slots: DashMap::new(),
            capacity,
            current_size: AtomicU64::new(0),
        }
    }

    /// Number of live slots (including not-yet-collected expired ones)
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check if the tier is empty
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Current body bytes held
    pub fn size(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }

    fn remove_slot(&self, key: &CacheKey) -> bool {
        match self.slots.remove(key) {
            Some((_, slot)) => {
                self.current_size
                    .fetch_sub(slot.entry.size() as u64, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Drop every expired slot
    fn purge_expired(&self) {
        let now = Instant::now();
        let expired: Vec<CacheKey> = self
            .slots
            .iter()
            .filter(|s| s.deadline <= now)
            .map(|s| *s.key())
            .collect();
        for key in expired {
            self.remove_slot(&key);
        }
    }
}

impl Default for InMemoryHotTier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HotTier for InMemoryHotTier {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let expired = match self.slots.get(key) {
            Some(slot) if slot.deadline > Instant::now() => return Ok(Some(slot.entry.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.remove_slot(key);
        }
        Ok(None)
    }

    async fn set(&self, entry: &CacheEntry, ttl: Duration) -> Result<()> {
        let size = entry.size() as u64;
        if size > self.capacity {
            return Ok(());
        }

        if self.current_size.load(Ordering::Relaxed) + size > self.capacity {
            self.purge_expired();
            if self.current_size.load(Ordering::Relaxed) + size > self.capacity {
                tracing::debug!(key = %entry.key, "Hot tier full, skipping write");
                return Ok(());
            }
        }

        let slot = Slot {
            entry: entry.clone(),
            deadline: Instant::now() + ttl,
        };
        if let Some(old) = self.slots.insert(entry.key, slot) {
            self.current_size
                .fetch_sub(old.entry.size() as u64, Ordering::Relaxed);
        }
        self.current_size.fetch_add(size, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.remove_slot(key))
    }

    async fn flush(&self) -> Result<()> {
        self.slots.clear();
        self.current_size.store(0, Ordering::Relaxed);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::HeaderMap;
    use bytes::Bytes;

    fn make_entry(path: &str, size: usize) -> CacheEntry {
        CacheEntry::new(
            CacheKey::derive("example.com", path),
            path,
            HeaderMap::new(),
            Bytes::from(vec![7u8; size]),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let tier = InMemoryHotTier::new();
        let entry = make_entry("/a", 10);

        tier.set(&entry, Duration::from_secs(60)).await.unwrap();
        let got = tier.get(&entry.key).await.unwrap().unwrap();
        assert_eq!(got.body, entry.body);
        assert_eq!(tier.size(), 10);

        assert!(tier.delete(&entry.key).await.unwrap());
        assert!(!tier.delete(&entry.key).await.unwrap());
        assert!(tier.get(&entry.key).await.unwrap().is_none());
        assert_eq!(tier.size(), 0);
    }

    #[tokio::test]
    async fn test_expired_slot_is_absent() {
        let tier = InMemoryHotTier::new();
        let entry = make_entry("/short", 4);

        tier.set(&entry, Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(tier.get(&entry.key).await.unwrap().is_none());
        assert!(tier.is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_tracks_size() {
        let tier = InMemoryHotTier::new();
        tier.set(&make_entry("/a", 100), Duration::from_secs(60))
            .await
            .unwrap();
        tier.set(&make_entry("/a", 40), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.size(), 40);
    }

    #[tokio::test]
    async fn test_capacity_bound() {
        let tier = InMemoryHotTier::with_capacity(100);
        tier.set(&make_entry("/a", 80), Duration::from_secs(60))
            .await
            .unwrap();
        tier.set(&make_entry("/b", 80), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(tier.len(), 1);
        assert!(tier.size() <= 100);
    }

    #[tokio::test]
    async fn test_flush() {
        let tier = InMemoryHotTier::new();
        for i in 0..10 {
            tier.set(&make_entry(&format!("/{}", i), 8), Duration::from_secs(60))
                .await
                .unwrap();
        }
        tier.flush().await.unwrap();
        assert!(tier.is_empty());
        assert_eq!(tier.size(), 0);
    }
}
