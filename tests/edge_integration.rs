//! Pravah Edge Integration Tests
//!
//! Runs a real edge server against a local origin:
//! - Cache miss, then hit from the hot or durable tier
//! - Response compression
//! - Purge through the control endpoint
//! - Unknown hosts and unreachable origins

use std::convert::Infallible;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use pravah::adapters::JsonTenantStore;
use pravah::domain::ports::TenantConfig;
use pravah::proxy::server::bind_shared;
use pravah::{EdgeConfig, EdgeServer, ServiceContext};

// =============================================================================
// Harness
// =============================================================================

const PAGE_SIZE: usize = 10 * 1024;

/// Origin serving a fixed text page and counting requests
async fn spawn_origin() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let counter = counter.clone();
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                counter.fetch_add(1, Ordering::SeqCst);
                let body = format!("{}{}", req.uri().path(), "x".repeat(PAGE_SIZE));
                async move {
                    Ok::<_, Infallible>(
                        Response::builder()
                            .header("content-type", "text/plain")
                            .header("cache-control", "max-age=300")
                            .body(Full::new(Bytes::from(body)))
                            .unwrap(),
                    )
                }
            });
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, hits)
}

struct Edge {
    addr: SocketAddr,
    drain: CancellationToken,
}

impl Edge {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for Edge {
    fn drop(&mut self) {
        self.drain.cancel();
    }
}

/// Edge node serving tenant `127.0.0.1` from `origin`
async fn spawn_edge(origin: Option<SocketAddr>, worker: Option<usize>) -> Edge {
    let mut config = EdgeConfig::default();
    config.cache.dir = std::env::temp_dir().join(format!("pravah-it-{}", uuid::Uuid::new_v4()));

    let tenants = JsonTenantStore::in_memory();
    let tenants = match origin {
        Some(addr) => tenants.with_domain("127.0.0.1", TenantConfig::new(format!("http://{}", addr))),
        None => tenants,
    };

    let mut builder = ServiceContext::builder(config).tenants(Arc::new(tenants));
    if let Some(id) = worker {
        builder = builder.worker(id);
    }
    let ctx = builder.build().await.unwrap();

    let listener = bind_shared("127.0.0.1:0".parse().unwrap()).unwrap();
    let server = EdgeServer::from_listener(ctx, listener);
    let addr = server.local_addr().unwrap();
    let drain = CancellationToken::new();
    tokio::spawn(server.serve(drain.clone()));

    Edge { addr, drain }
}

fn x_cache(resp: &reqwest::Response) -> String {
    resp.headers()
        .get("x-cache")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

// =============================================================================
// Caching
// =============================================================================

mod caching_tests {
    use super::*;

    #[tokio::test]
    async fn test_miss_then_hot_hit() {
        let (origin, hits) = spawn_origin().await;
        let edge = spawn_edge(Some(origin), None).await;

        let first = reqwest::get(edge.url("/page")).await.unwrap();
        assert_eq!(first.status(), 200);
        assert_eq!(x_cache(&first), "MISS");
        assert!(first.headers().contains_key("x-worker"));
        let first_body = first.bytes().await.unwrap();

        let second = reqwest::get(edge.url("/page")).await.unwrap();
        assert_eq!(second.status(), 200);
        assert_eq!(x_cache(&second), "HIT-HOT");
        assert_eq!(second.bytes().await.unwrap(), first_body);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_worker_without_redis_hits_disk() {
        let (origin, hits) = spawn_origin().await;
        let edge = spawn_edge(Some(origin), Some(1)).await;

        let first = reqwest::get(edge.url("/asset.txt")).await.unwrap();
        assert_eq!(x_cache(&first), "MISS");
        let second = reqwest::get(edge.url("/asset.txt")).await.unwrap();
        assert_eq!(x_cache(&second), "HIT-DISK");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_query_string_is_part_of_the_key() {
        let (origin, hits) = spawn_origin().await;
        let edge = spawn_edge(Some(origin), None).await;

        reqwest::get(edge.url("/list?page=1")).await.unwrap();
        let other = reqwest::get(edge.url("/list?page=2")).await.unwrap();
        assert_eq!(x_cache(&other), "MISS");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_purge_forces_refetch() {
        let (origin, hits) = spawn_origin().await;
        let edge = spawn_edge(Some(origin), None).await;

        reqwest::get(edge.url("/doc")).await.unwrap();
        let purge: serde_json::Value = reqwest::get(edge.url("/cdn-purge?path=/doc&domain=127.0.0.1"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(purge["success"], true);
        assert_eq!(purge["count"], 2);

        let after = reqwest::get(edge.url("/doc")).await.unwrap();
        assert_eq!(x_cache(&after), "MISS");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_purge_without_domain_is_rejected() {
        let edge = spawn_edge(None, None).await;
        let resp = reqwest::get(edge.url("/cdn-purge?path=/doc")).await.unwrap();
        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["success"], false);
    }
}

// =============================================================================
// Response Pipeline
// =============================================================================

mod pipeline_tests {
    use super::*;
    use flate2::read::GzDecoder;

    #[tokio::test]
    async fn test_gzip_on_miss_and_hit() {
        let (origin, _) = spawn_origin().await;
        let edge = spawn_edge(Some(origin), None).await;
        let client = reqwest::Client::new();

        for expected in ["MISS", "HIT-HOT"] {
            let resp = client
                .get(edge.url("/big"))
                .header("accept-encoding", "gzip")
                .send()
                .await
                .unwrap();
            assert_eq!(x_cache(&resp), expected);
            assert_eq!(resp.headers()["content-encoding"], "gzip");
            assert_eq!(resp.headers()["vary"], "Accept-Encoding");

            let compressed = resp.bytes().await.unwrap();
            assert!(compressed.len() < PAGE_SIZE);
            let mut plain = String::new();
            GzDecoder::new(&compressed[..]).read_to_string(&mut plain).unwrap();
            assert!(plain.starts_with("/big"));
            assert_eq!(plain.len(), "/big".len() + PAGE_SIZE);
        }
    }

    #[tokio::test]
    async fn test_identity_without_accept_encoding() {
        let (origin, _) = spawn_origin().await;
        let edge = spawn_edge(Some(origin), None).await;

        let resp = reqwest::get(edge.url("/plain")).await.unwrap();
        assert!(!resp.headers().contains_key("content-encoding"));
        assert_eq!(resp.bytes().await.unwrap().len(), "/plain".len() + PAGE_SIZE);
    }
}

// =============================================================================
// Failure Paths
// =============================================================================

mod failure_tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_host_landing_page() {
        let edge = spawn_edge(None, None).await;
        let resp = reqwest::get(edge.url("/")).await.unwrap();
        assert_eq!(resp.status(), 404);
        assert!(resp.text().await.unwrap().contains("Pravah CDN"));
    }

    #[tokio::test]
    async fn test_unreachable_origin_is_bad_gateway() {
        // Reserve a port, then close it so nothing is listening
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let edge = spawn_edge(Some(closed), None).await;

        let resp = reqwest::get(edge.url("/x")).await.unwrap();
        assert_eq!(resp.status(), 502);
        assert_eq!(resp.text().await.unwrap(), "Bad Gateway");

        let stats: serde_json::Value = reqwest::get(edge.url("/cdn-stats")).await.unwrap().json().await.unwrap();
        assert_eq!(stats["errors"], 1);
    }
}
