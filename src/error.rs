//! Error types for the Pravah edge node

use hyper::StatusCode;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Pravah edge node
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP server error
    #[error("HTTP server error: {0}")]
    Http(#[from] hyper::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Request Rejections (user-visible)
    // =========================================================================
    /// Rate limit exceeded
    #[error("Too Many Requests (Rate limit exceeded)")]
    AdmissionRejected,

    /// Security filter blocked the request
    #[error("Forbidden: {reason}")]
    SecurityRejected { reason: String },

    /// No origin configured for the hostname
    #[error("Unknown tenant: {hostname}")]
    UnknownTenant { hostname: String },

    /// Origin unreachable or connection failure
    #[error("Bad Gateway: origin {origin} failed: {reason}")]
    Gateway { origin: String, reason: String },

    // =========================================================================
    // Backing Store Errors (recovered locally)
    // =========================================================================
    /// Distributed store unreachable or erroring
    #[error("Backing store degraded: {0}")]
    BackingStoreDegraded(String),

    /// Redis command failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Durable-tier metadata could not be parsed
    #[error("Corrupt cache record {key}: {reason}")]
    CorruptCacheRecord { key: String, reason: String },

    // =========================================================================
    // Transform Errors (recovered locally)
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Content transform hook failed
    #[error("Content transform failed: {0}")]
    TransformFailed(String),

    // =========================================================================
    // Control Plane Errors
    // =========================================================================
    /// Purge target could not be resolved to a cache key
    #[error("Invalid purge target: {0}")]
    InvalidPurgeTarget(String),

    /// Worker supervision failure
    #[error("Supervisor error: {0}")]
    Supervisor(String),
}

impl Error {
    /// HTTP status for errors that are surfaced to clients.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::AdmissionRejected => StatusCode::TOO_MANY_REQUESTS,
            Error::SecurityRejected { .. } => StatusCode::FORBIDDEN,
            Error::UnknownTenant { .. } => StatusCode::NOT_FOUND,
            Error::Gateway { .. } => StatusCode::BAD_GATEWAY,
            Error::InvalidPurgeTarget(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error is part of the client-visible taxonomy.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Error::AdmissionRejected
                | Error::SecurityRejected { .. }
                | Error::UnknownTenant { .. }
                | Error::Gateway { .. }
        )
    }
}
