//! Domain Layer
//!
//! - **Ports** (`ports.rs`) - trait abstractions for tenant configuration,
//!   security, extensibility hooks, content transforms and analytics
//! - **Events** (`events.rs`) - events carried by the invalidation bus

pub mod events;
pub mod ports;

pub use events::{EdgeEvent, PurgeSelector};
pub use ports::{
    // Port traits
    ContentTransform,
    EdgeHook,
    SecurityFilter,
    TenantStore,
    TrafficRecorder,
    // Value objects
    EdgeRequest,
    EdgeRule,
    HookOutcome,
    HookPhase,
    RequestOutcome,
    SecurityVerdict,
    TenantAttrs,
    TenantConfig,
    TransformOutput,
    TransformParams,
};
