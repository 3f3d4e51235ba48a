//! Pravah - Multi-tenant CDN Edge Node
//!
//! A reverse proxy that maps each request's hostname to a tenant origin,
//! serves cached responses from a two-tier cache, and fetches, compresses
//! and caches on a miss. A primary process supervises a pool of workers
//! sharing one listening port.
//!
//! # Architecture
//!
//! ```text
//! request ─▶ AdmissionControl ─▶ TenantStore ─▶ TieredCache ─┬─ hit ─▶ ResponsePipeline
//!                                                            └─ miss ─▶ OriginFetcher ─▶ put ─▶ ResponsePipeline
//!
//! InvalidationBus ──▶ TieredCache.evict / TenantStore.reload   (every worker)
//! CacheReaper     ──▶ durable tier sweep                        (primary only)
//! ProcessSupervisor ──▶ worker pool lifecycle
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Default port implementations (JSON tenants, Redis, analytics)
//! - [`admission`] - Fixed-window rate limiting with local fallback
//! - [`bus`] - Cross-process purge and config-change events
//! - [`cache`] - Content addressing, hot/durable tiers, reaper
//! - [`config`] - CLI flags and typed configuration
//! - [`context`] - Per-process service context
//! - [`domain`] - Ports and events
//! - [`error`] - Error types
//! - [`proxy`] - Origin fetch, response pipeline, handler and server
//! - [`supervisor`] - Primary/worker process supervision

pub mod adapters;
pub mod admission;
pub mod bus;
pub mod cache;
pub mod config;
pub mod context;
pub mod domain;
pub mod error;
pub mod proxy;
pub mod supervisor;

// Re-export commonly used types
pub use admission::AdmissionControl;
pub use bus::InvalidationBus;
pub use cache::{CacheKey, TieredCache};
pub use config::EdgeConfig;
pub use context::ServiceContext;
pub use error::{Error, Result};
pub use proxy::EdgeServer;
pub use supervisor::ProcessSupervisor;
