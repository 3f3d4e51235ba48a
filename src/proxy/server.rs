//! Edge HTTP Server
//!
//! HTTP/1.1 accept loop over a listening socket opened with `SO_REUSEPORT`,
//! so every worker process binds the same port and the kernel spreads
//! connections between them. Draining stops the accept loop and waits for
//! open connections to finish, bounded by `drain_timeout`.

use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::{TcpListener, TcpSocket};
use tokio_util::sync::CancellationToken;

use super::handler;
use crate::context::ServiceContext;
use crate::error::{Error, Result};

/// Default drain timeout for a worker
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Listener configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    /// Time allowed for in-flight requests once draining starts
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 5000,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

/// How a drain ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every connection closed on its own
    Drained,
    /// Connections were still open when the timeout hit
    TimedOut,
}

/// Open a listener that other processes may bind too
pub fn bind_shared(addr: SocketAddr) -> Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket
        .bind(addr)
        .map_err(|e| Error::Config(format!("Failed to bind {}: {}", addr, e)))?;
    Ok(socket.listen(1024)?)
}

/// Request-serving loop of one process
pub struct EdgeServer {
    ctx: Arc<ServiceContext>,
    listener: TcpListener,
}

impl EdgeServer {
    /// Bind the configured address
    pub fn bind(ctx: Arc<ServiceContext>) -> Result<Self> {
        let listener = bind_shared(ctx.config.server.addr())?;
        Ok(Self { ctx, listener })
    }

    /// Serve on an existing listener
    pub fn from_listener(ctx: Arc<ServiceContext>, listener: TcpListener) -> Self {
        Self { ctx, listener }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `drain` fires, then wait for open ones
    pub async fn serve(self, drain: CancellationToken) -> Result<DrainOutcome> {
        let graceful = GracefulShutdown::new();
        tracing::info!(addr = %self.local_addr()?, worker = ?self.ctx.worker, "Edge server listening");

        loop {
            tokio::select! {
                _ = drain.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept error");
                            continue;
                        }
                    };

                    let ctx = self.ctx.clone();
                    let service = service_fn(move |req| {
                        let ctx = ctx.clone();
                        async move { Ok::<_, Infallible>(handler::handle(ctx, req, peer.ip()).await) }
                    });
                    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
                    let conn = graceful.watch(conn);

                    tokio::spawn(async move {
                        if let Err(e) = conn.await {
                            tracing::debug!(%peer, error = %e, "Connection error");
                        }
                    });
                }
            }
        }

        // Stop accepting before waiting on open connections
        drop(self.listener);
        tracing::info!(worker = ?self.ctx.worker, "Draining connections");

        tokio::select! {
            _ = graceful.shutdown() => {
                tracing::info!(worker = ?self.ctx.worker, "All connections drained");
                Ok(DrainOutcome::Drained)
            }
            _ = tokio::time::sleep(self.ctx.config.server.drain_timeout) => {
                tracing::warn!(worker = ?self.ctx.worker, "Drain timeout elapsed, closing remaining connections");
                Ok(DrainOutcome::TimedOut)
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
