//! Response Compression
//!
//! Per-client content encoding negotiated from `Accept-Encoding`.
//! Preference order is brotli, gzip, deflate. Bodies at or below
//! [`MIN_COMPRESS_SIZE`] bytes are never compressed. A compressor failure
//! falls back to the identity body; it never fails the response.
//! Bodies above [`BLOCKING_COMPRESS_SIZE`] are compressed on the blocking
//! pool so large assets do not stall the request executor.

use std::io::Write;

use bytes::Bytes;
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;

use crate::error::{Error, Result};

/// Bodies must be strictly larger than this to be compressed
pub const MIN_COMPRESS_SIZE: usize = 128;

/// Bodies larger than this are compressed off the async executor
pub const BLOCKING_COMPRESS_SIZE: usize = 64 * 1024;

// =============================================================================
// Encoding
// =============================================================================

/// Content encodings this node can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Brotli,
    Gzip,
    Deflate,
    Identity,
}

impl Encoding {
    /// `Content-Encoding` token
    pub fn name(&self) -> &'static str {
        match self {
            Encoding::Brotli => "br",
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
            Encoding::Identity => "identity",
        }
    }

    /// Pick the preferred encoding the client accepts.
    ///
    /// Tokens with `q=0` are treated as refused.
    pub fn negotiate(accept_encoding: Option<&str>) -> Self {
        let Some(header) = accept_encoding else {
            return Encoding::Identity;
        };

        let accepted: Vec<String> = header
            .split(',')
            .filter_map(|item| {
                let mut parts = item.split(';');
                let token = parts.next()?.trim().to_ascii_lowercase();
                let refused = parts.any(|p| {
                    p.trim()
                        .strip_prefix("q=")
                        .and_then(|q| q.trim().parse::<f32>().ok())
                        .is_some_and(|q| q <= 0.0)
                });
                (!token.is_empty() && !refused).then_some(token)
            })
            .collect();

        [Encoding::Brotli, Encoding::Gzip, Encoding::Deflate]
            .into_iter()
            .find(|e| accepted.iter().any(|t| t == e.name()))
            .unwrap_or(Encoding::Identity)
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Compression Configuration
// =============================================================================

/// Configuration for response compression
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Whether compression is enabled at all
    pub enabled: bool,
    /// Gzip / deflate level (0-9)
    pub gzip_level: u32,
    /// Brotli quality (0-11)
    pub brotli_quality: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            gzip_level: 6,
            brotli_quality: 5,
        }
    }
}

// =============================================================================
// Compressor
// =============================================================================

/// Stateless response compressor
#[derive(Debug, Clone, Default)]
pub struct Compressor {
    config: CompressionConfig,
}

impl Compressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Compress `body` for a client sending `accept_encoding`.
    ///
    /// Returns the body to send and the encoding applied (`Identity` when
    /// nothing was done).
    pub fn compress(&self, body: Bytes, accept_encoding: Option<&str>) -> (Bytes, Encoding) {
        if !self.config.enabled || body.len() <= MIN_COMPRESS_SIZE {
            return (body, Encoding::Identity);
        }

        let encoding = Encoding::negotiate(accept_encoding);
        if encoding == Encoding::Identity {
            return (body, Encoding::Identity);
        }

        match self.compress_with(&body, encoding) {
            Ok(compressed) => (Bytes::from(compressed), encoding),
            Err(e) => {
                tracing::warn!(error = %e, "Compression failed, sending identity body");
                (body, Encoding::Identity)
            }
        }
    }

    /// Async variant of [`Compressor::compress`] for request handlers.
    ///
    /// Large bodies run on `spawn_blocking`; a failed blocking task yields
    /// the identity body.
    pub async fn compress_async(&self, body: Bytes, accept_encoding: Option<&str>) -> (Bytes, Encoding) {
        if body.len() <= BLOCKING_COMPRESS_SIZE {
            return self.compress(body, accept_encoding);
        }
        if !self.config.enabled || Encoding::negotiate(accept_encoding) == Encoding::Identity {
            return (body, Encoding::Identity);
        }

        let compressor = self.clone();
        let accept = accept_encoding.map(str::to_string);
        let input = body.clone();
        match tokio::task::spawn_blocking(move || compressor.compress(input, accept.as_deref())).await {
            Ok(out) => out,
            Err(e) => {
                tracing::warn!(error = %e, "Compression task failed, sending identity body");
                (body, Encoding::Identity)
            }
        }
    }

    /// Compress with a specific encoding
    pub fn compress_with(&self, data: &[u8], encoding: Encoding) -> Result<Vec<u8>> {
        let failed = |reason: std::io::Error| Error::CompressionFailed {
            algorithm: encoding.name().to_string(),
            reason: reason.to_string(),
        };

        match encoding {
            Encoding::Brotli => {
                let mut compressed = Vec::with_capacity(data.len() / 2);
                let params = brotli::enc::BrotliEncoderParams {
                    quality: self.config.brotli_quality,
                    ..Default::default()
                };
                let mut input = std::io::Cursor::new(data);
                brotli::BrotliCompress(&mut input, &mut compressed, &params).map_err(failed)?;
                Ok(compressed)
            }
            Encoding::Gzip => {
                let level = Compression::new(self.config.gzip_level);
                let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), level);
                encoder.write_all(data).map_err(failed)?;
                encoder.finish().map_err(failed)
            }
            Encoding::Deflate => {
                let level = Compression::new(self.config.gzip_level);
                let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), level);
                encoder.write_all(data).map_err(failed)?;
                encoder.finish().map_err(failed)
            }
            Encoding::Identity => Ok(data.to_vec()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
