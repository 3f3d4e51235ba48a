//! Request Handler
//!
//! Control endpoints are answered directly; everything else goes through
//! the edge flow:
//!
//! ```text
//! admission ─▶ tenant ─▶ security ─▶ edge rules ─▶ cache ─┬─ hit ──────────────────▶ pipeline
//!   429         404        403        (respond)           └─ miss ─▶ origin ─▶ put ─▶ pipeline
//!                                                                    502
//! ```

use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::header::{AUTHORIZATION, HOST};
use hyper::{Method, Request, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::landing::LANDING_PAGE;
use super::pipeline::MISS;
use super::response::{self, EdgeResponse};
use crate::adapters::analytics::StatsSnapshot;
use crate::domain::ports::normalize_hostname as normalize;
use crate::cache::{CacheEntry, CacheKey, MetricsSnapshot};
use crate::context::ServiceContext;
use crate::domain::events::PurgeSelector;
use crate::domain::ports::{
    EdgeRequest, HookOutcome, HookPhase, RequestOutcome, TenantAttrs, TrafficRecorder,
};
use crate::error::{Error, Result};

/// Handle one request; never fails, unexpected errors become a 500
pub async fn handle<B>(ctx: Arc<ServiceContext>, req: Request<B>, client_ip: IpAddr) -> EdgeResponse
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    match path.as_str() {
        "/health" => response::text(StatusCode::OK, "OK"),
        "/favicon.ico" => response::empty(StatusCode::NO_CONTENT),
        "/cdn-purge" if method == Method::GET || method == Method::POST => {
            purge(&ctx, req.uri().query()).await
        }
        "/cdn-stats" if method == Method::GET => stats(&ctx),
        "/admin/domains" => admin_domains(&ctx, req).await,
        _ => match proxy(&ctx, req, client_ip).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!(%path, error = %e, "Unhandled request error");
                response::internal_error()
            }
        },
    }
}

// =============================================================================
// Edge Flow
// =============================================================================

async fn proxy<B>(ctx: &ServiceContext, req: Request<B>, client_ip: IpAddr) -> Result<EdgeResponse>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let (parts, body) = req.into_parts();
    let host = parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| parts.uri.host())
        .unwrap_or_default();
    let request = EdgeRequest {
        method: parts.method.clone(),
        hostname: normalize(host),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers,
        client_ip,
    };

    if !ctx.admission.admit(&client_ip.to_string()).await {
        ctx.stats.record_request(RequestOutcome::Blocked, &request.hostname);
        return Ok(rejection(Error::AdmissionRejected));
    }

    let Some(tenant) = ctx.tenants.get_config(&request.hostname) else {
        tracing::warn!(hostname = %request.hostname, path = %request.path, "Unknown host request");
        return Ok(response::html(
            Error::UnknownTenant { hostname: request.hostname }.status_code(),
            LANDING_PAGE,
        ));
    };

    let verdict = ctx.security.check(&request, &tenant);
    if verdict.blocked {
        ctx.stats.record_request(RequestOutcome::Blocked, &request.hostname);
        return Ok(rejection(Error::SecurityRejected {
            reason: verdict.reason.unwrap_or_else(|| "Blocked".into()),
        }));
    }

    for rule in &tenant.edge_rules {
        if let HookOutcome::Respond(resp) = ctx.hooks.run(rule, &request, HookPhase::Request).await {
            return Ok(resp);
        }
    }

    let target = request.path_and_query();
    let key = CacheKey::derive(&request.hostname, &target);
    let cacheable_method = request.method == Method::GET || request.method == Method::HEAD;

    if cacheable_method {
        if let Some(hit) = ctx.cache.get(&key).await {
            let status = hit.cache_status();
            tracing::info!(hostname = %request.hostname, path = %target, cache_status = %status, "Cache hit");
            ctx.stats.record_request(RequestOutcome::Hit, &request.hostname);
            let entry = hit.entry;
            return Ok(ctx
                .pipeline
                .send(&request, StatusCode::OK, &entry.headers, entry.body, &status)
                .await);
        }
    }

    tracing::info!(hostname = %request.hostname, path = %target, origin = %tenant.origin, "Cache miss, fetching origin");
    ctx.stats.record_request(RequestOutcome::Miss, &request.hostname);

    let body = body
        .collect()
        .await
        .map_err(|e| Error::Internal(format!("failed to read request body: {}", e)))?
        .to_bytes();

    let fetched = match ctx
        .origin
        .fetch(&tenant.origin, &request.method, &target, &request.headers, body)
        .await
    {
        Ok(fetched) => fetched,
        Err(e @ Error::Gateway { .. }) => {
            tracing::error!(hostname = %request.hostname, origin = %tenant.origin, error = %e, "Proxy request error");
            ctx.stats.record_request(RequestOutcome::Error, &request.hostname);
            return Ok(response::text(e.status_code(), "Bad Gateway"));
        }
        Err(e) => return Err(e),
    };

    if fetched.is_cacheable(&request.method) {
        let entry = CacheEntry::new(
            key,
            target.clone(),
            fetched.headers.clone(),
            fetched.body.clone(),
            fetched.ttl,
        );
        if let Err(e) = ctx.cache.put(entry, fetched.ttl).await {
            tracing::error!(hostname = %request.hostname, path = %target, error = %e, "Cache write failed");
        }
    }

    Ok(ctx
        .pipeline
        .send(&request, fetched.status, &fetched.headers, fetched.body, MISS)
        .await)
}

fn rejection(err: Error) -> EdgeResponse {
    response::text(err.status_code(), err.to_string())
}

// =============================================================================
// Purge
// =============================================================================

#[derive(Debug, Serialize)]
struct PurgeResult {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn purge(ctx: &ServiceContext, query: Option<&str>) -> EdgeResponse {
    let target = query_param(query, "path");
    let domain = query_param(query, "domain");

    let selector = match PurgeSelector::parse(target.as_deref(), domain.as_deref()) {
        Ok(selector) => selector,
        Err(e) => {
            let message = match e {
                Error::InvalidPurgeTarget(msg) => msg,
                other => other.to_string(),
            };
            return response::json(
                StatusCode::BAD_REQUEST,
                &PurgeResult {
                    success: false,
                    count: None,
                    error: Some(message),
                },
            );
        }
    };

    match ctx.purge(selector).await {
        Ok(count) => response::json(
            StatusCode::OK,
            &PurgeResult {
                success: true,
                count: Some(count),
                error: None,
            },
        ),
        Err(e) => {
            tracing::error!(error = %e, "Purge failed");
            response::json(
                StatusCode::INTERNAL_SERVER_ERROR,
                &PurgeResult {
                    success: false,
                    count: None,
                    error: Some(e.to_string()),
                },
            )
        }
    }
}

/// First value of a query parameter, percent-decoded
fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key != name {
            return None;
        }
        let value = value.replace('+', " ");
        Some(
            urlencoding::decode(&value)
                .map(|v| v.into_owned())
                .unwrap_or(value),
        )
    })
}

// =============================================================================
// Stats
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsView {
    #[serde(flatten)]
    traffic: StatsSnapshot,
    hit_ratio: f64,
    active_domains: usize,
    cache: MetricsSnapshot,
    worker: Option<usize>,
}

fn stats(ctx: &ServiceContext) -> EdgeResponse {
    let traffic = ctx.stats.snapshot();
    let view = StatsView {
        hit_ratio: traffic.totals.hit_ratio(),
        traffic,
        active_domains: ctx.tenants.list_all().len(),
        cache: ctx.cache.metrics().snapshot(),
        worker: ctx.worker,
    };
    response::json(StatusCode::OK, &view)
}

// =============================================================================
// Admin API
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DomainRequest {
    hostname: Option<String>,
    origin: Option<String>,
    #[serde(flatten)]
    attrs: TenantAttrs,
}

async fn admin_domains<B>(ctx: &ServiceContext, req: Request<B>) -> EdgeResponse
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    if !authorized(ctx, &req) {
        return response::json(StatusCode::UNAUTHORIZED, &json!({"success": false, "msg": "Unauthorized"}));
    }

    let method = req.method().clone();
    if method == Method::GET {
        return response::json(StatusCode::OK, &ctx.tenants.list_all());
    }
    if method != Method::POST && method != Method::DELETE {
        return response::empty(StatusCode::METHOD_NOT_ALLOWED);
    }

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read admin request body");
            return response::text(StatusCode::BAD_REQUEST, "Invalid JSON");
        }
    };
    let Ok(data) = serde_json::from_slice::<DomainRequest>(&body) else {
        return response::text(StatusCode::BAD_REQUEST, "Invalid JSON");
    };

    if method == Method::POST {
        let (Some(hostname), Some(origin)) = (data.hostname, data.origin) else {
            return response::json(
                StatusCode::BAD_REQUEST,
                &json!({"success": false, "msg": "Missing hostname or origin"}),
            );
        };
        match ctx.tenants.add_domain(&hostname, &origin, data.attrs) {
            Ok(()) => {
                ctx.tenants_changed(&hostname).await;
                response::json(StatusCode::OK, &json!({"success": true, "msg": format!("Added {}", hostname)}))
            }
            Err(Error::Config(msg)) => {
                response::json(StatusCode::BAD_REQUEST, &json!({"success": false, "msg": msg}))
            }
            Err(e) => {
                tracing::error!(%hostname, error = %e, "Failed to add domain");
                response::internal_error()
            }
        }
    } else {
        let Some(hostname) = data.hostname else {
            return response::text(StatusCode::BAD_REQUEST, "Missing hostname");
        };
        match ctx.tenants.remove_domain(&hostname) {
            Ok(removed) => {
                if removed {
                    ctx.tenants_changed(&hostname).await;
                }
                let msg = if removed {
                    format!("Removed {}", hostname)
                } else {
                    "Not found".to_string()
                };
                response::json(StatusCode::OK, &json!({"success": removed, "msg": msg}))
            }
            Err(e) => {
                tracing::error!(%hostname, error = %e, "Failed to remove domain");
                response::internal_error()
            }
        }
    }
}

fn authorized<B>(ctx: &ServiceContext, req: &Request<B>) -> bool {
    let Some(token) = &ctx.config.admin_token else {
        return true;
    };
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|presented| presented == token)
}

// =============================================================================
// Tests
// =============================================================================
