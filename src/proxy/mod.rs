//! Edge Proxy
//!
//! - **Origin** (`origin.rs`) - upstream fetch and TTL derivation
//! - **Pipeline** (`pipeline.rs`) - transform, compression, diagnostics
//! - **Handler** (`handler.rs`) - control endpoints and the edge flow
//! - **Server** (`server.rs`) - shared-port HTTP/1.1 accept loop with draining

pub mod compression;
pub mod handler;
pub mod landing;
pub mod origin;
pub mod pipeline;
pub mod response;
pub mod server;

pub use compression::{CompressionConfig, Compressor, Encoding};
pub use origin::{OriginConfig, OriginFetcher, OriginResponse};
pub use pipeline::ResponsePipeline;
pub use server::{DrainOutcome, EdgeServer, ServerConfig};
