//! Two-Tier Edge Cache
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         TieredCache                               │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  Hot tier (volatile)          │  Durable tier (disk)             │
//! │  ┌─────────────────────────┐  │  ┌────────────────────────────┐  │
//! │  │ Redis  meta:<hex>       │  │  │ <cache-dir>/<hex>       body│  │
//! │  │        body:<hex>       │  │  │ <cache-dir>/<hex>.json  meta│  │
//! │  │  - or - in-process map  │  │  └────────────────────────────┘  │
//! │  └─────────────────────────┘  │               │                  │
//! │            ▲                  │               │                  │
//! │            └── fire-and-forget repopulate ────┘                  │
//! │                                                                  │
//! │                 CacheReaper (primary only, every 10 min)         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The durable tier is authoritative for validity. The hot tier may be
//! absent, lagging or unreachable without affecting correctness.

pub mod durable;
pub mod entry;
pub mod hot;
pub mod key;
mod manager;
mod metrics;
pub mod reaper;

pub use durable::{DurableLookup, DurableTier};
pub use entry::{CacheEntry, EntryMetadata, HeaderMap};
pub use hot::{HotTier, InMemoryHotTier};
pub use key::CacheKey;
pub use manager::{CacheResult, CacheTier, TieredCache};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use reaper::{CacheReaper, SweepReport};

/// Default TTL when the origin sends no `max-age` (1 hour)
pub const DEFAULT_TTL_SECS: u64 = 3600;
