//! Infrastructure Adapters
//!
//! Default implementations of the domain ports plus the Redis-backed
//! implementations of the cache, admission and bus seams.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  TenantStore │ SecurityFilter │ EdgeHook │ TrafficRecorder │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ JsonTenantStore │ PatternFilter │ BuiltinRules │ TrafficStats│ │
//! │  │ RedisHotTier │ RedisCounterStore │ RedisTransport          │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use pravah::adapters::JsonTenantStore;
//! use pravah::domain::ports::TenantStore;
//!
//! let tenants = JsonTenantStore::open("./domains.json")?;
//! let origin = tenants.resolve_origin("shop.example.com");
//! ```

pub mod analytics;
pub mod redis;
pub mod rules;
pub mod security;
pub mod tenant_store;

pub use analytics::{StatsSnapshot, TrafficStats};
pub use self::redis::{RedisConnector, RedisCounterStore, RedisHotTier, RedisTransport};
pub use rules::BuiltinRules;
pub use security::PatternFilter;
pub use tenant_store::JsonTenantStore;
