//! Response Pipeline
//!
//! Turns a buffered body and its stored headers into the client response:
//!
//! 1. optional content transform (images with `w`/`h`/`q`/`format`)
//! 2. compression negotiated from `Accept-Encoding`
//! 3. `Content-Length` dropped, hyper computes framing
//! 4. `X-Cache` / `X-Worker` diagnostics
//! 5. bandwidth accounting
//!
//! Transform and compression failures are never fatal; the untransformed
//! body goes out instead.

use std::sync::Arc;

use bytes::Bytes;
use hyper::header::{HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE, VARY};
use hyper::{Method, StatusCode};

use super::compression::{Compressor, Encoding};
use super::response::EdgeResponse;
use crate::cache::entry::{HeaderMap as StoredHeaders, HeaderValues};
use crate::domain::ports::{ContentTransform, EdgeRequest, TrafficRecorder, TransformParams};

/// Cache diagnostic header
pub const X_CACHE: &str = "x-cache";

/// Serving process diagnostic header
pub const X_WORKER: &str = "x-worker";

/// Status label for responses fetched from origin
pub const MISS: &str = "MISS";

/// Response pipeline shared by every request of a process
pub struct ResponsePipeline {
    compressor: Compressor,
    transform: Option<Arc<dyn ContentTransform>>,
    recorder: Arc<dyn TrafficRecorder>,
    worker: HeaderValue,
}

impl ResponsePipeline {
    pub fn new(compressor: Compressor, recorder: Arc<dyn TrafficRecorder>) -> Self {
        Self {
            compressor,
            transform: None,
            recorder,
            worker: HeaderValue::from(std::process::id()),
        }
    }

    /// Install a content transform hook
    pub fn with_transform(mut self, transform: Arc<dyn ContentTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Build the client response for `body`
    pub async fn send(
        &self,
        request: &EdgeRequest,
        status: StatusCode,
        headers: &StoredHeaders,
        body: Bytes,
        cache_status: &str,
    ) -> EdgeResponse {
        let mut content_type = headers.get("content-type").map(|v| v.first().to_string());
        // Origins may ignore the missing Accept-Encoding; never re-encode those bodies
        let pre_encoded = headers
            .get("content-encoding")
            .is_some_and(|v| !v.first().eq_ignore_ascii_case("identity"));

        let mut body = body;
        if !pre_encoded {
            if let Some(transformed) = self.apply_transform(request, content_type.as_deref(), &body).await {
                body = transformed.body;
                content_type = Some(transformed.content_type);
            }
        }

        let (body, encoding) = if pre_encoded {
            (body, Encoding::Identity)
        } else {
            self.compressor
                .compress_async(body, request.header("accept-encoding"))
                .await
        };

        let sent = if request.method == Method::HEAD { 0 } else { body.len() as u64 };
        let mut resp = EdgeResponse::new(http_body_util::Full::new(body));
        *resp.status_mut() = status;

        let out = resp.headers_mut();
        for (name, value) in headers {
            if matches!(name.as_str(), "content-length" | "content-type" | "x-cache" | "x-worker") {
                continue;
            }
            if encoding != Encoding::Identity && name == "content-encoding" {
                continue;
            }
            append_stored(out, name, value);
        }
        if let Some(ct) = content_type.and_then(|ct| HeaderValue::from_str(&ct).ok()) {
            out.insert(CONTENT_TYPE, ct);
        }
        if encoding != Encoding::Identity {
            out.insert(CONTENT_ENCODING, HeaderValue::from_static(encoding.name()));
            out.append(VARY, HeaderValue::from_static("Accept-Encoding"));
        }
        if let Ok(label) = HeaderValue::from_str(cache_status) {
            out.insert(HeaderName::from_static(X_CACHE), label);
        }
        out.insert(HeaderName::from_static(X_WORKER), self.worker.clone());

        self.recorder.record_bandwidth(sent, &request.hostname);
        resp
    }

    async fn apply_transform(
        &self,
        request: &EdgeRequest,
        content_type: Option<&str>,
        body: &Bytes,
    ) -> Option<crate::domain::ports::TransformOutput> {
        let transform = self.transform.as_ref()?;
        if !content_type.is_some_and(|ct| ct.starts_with("image/")) {
            return None;
        }
        let params = TransformParams::from_query(request.query.as_deref(), request.header("accept"));
        if !params.is_requested() {
            return None;
        }

        match transform.transform(body.clone(), &params).await {
            Ok(output) => Some(output),
            Err(e) => {
                tracing::warn!(hostname = %request.hostname, path = %request.path, error = %e, "Transform failed, serving original");
                None
            }
        }
    }
}

/// Replay one stored header, one field line per value
fn append_stored(out: &mut hyper::HeaderMap, name: &str, values: &HeaderValues) {
    let Ok(header) = HeaderName::from_bytes(name.as_bytes()) else {
        tracing::debug!(header = %name, "Dropping unrepresentable stored header");
        return;
    };
    for value in values.iter() {
        match HeaderValue::from_str(value) {
            Ok(value) => {
                out.append(header.clone(), value);
            }
            Err(_) => tracing::debug!(header = %name, "Dropping unrepresentable stored header value"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
