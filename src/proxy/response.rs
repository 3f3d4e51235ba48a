//! Response builders
//!
//! Built from `Response::new` plus setters rather than `Response::builder`,
//! so none of them can fail.

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Response type produced by every handler
pub type EdgeResponse = Response<Full<Bytes>>;

/// Body-less response
pub fn empty(status: StatusCode) -> EdgeResponse {
    with_body(status, Bytes::new(), None)
}

/// Plain-text response
pub fn text(status: StatusCode, body: impl Into<String>) -> EdgeResponse {
    with_body(
        status,
        Bytes::from(body.into()),
        Some(HeaderValue::from_static("text/plain; charset=utf-8")),
    )
}

/// HTML response
pub fn html(status: StatusCode, body: &'static str) -> EdgeResponse {
    with_body(
        status,
        Bytes::from_static(body.as_bytes()),
        Some(HeaderValue::from_static("text/html; charset=utf-8")),
    )
}

/// JSON response; serialization failures become a 500
pub fn json<T: Serialize>(status: StatusCode, value: &T) -> EdgeResponse {
    match serde_json::to_vec(value) {
        Ok(body) => with_body(
            status,
            Bytes::from(body),
            Some(HeaderValue::from_static("application/json")),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize JSON response");
            internal_error()
        }
    }
}

/// Generic 500 for unexpected failures
pub fn internal_error() -> EdgeResponse {
    text(StatusCode::INTERNAL_SERVER_ERROR, "Internal CDN Error")
}

fn with_body(status: StatusCode, body: Bytes, content_type: Option<HeaderValue>) -> EdgeResponse {
    let mut resp = Response::new(Full::new(body));
    *resp.status_mut() = status;
    if let Some(ct) = content_type {
        resp.headers_mut().insert(CONTENT_TYPE, ct);
    }
    resp
}
