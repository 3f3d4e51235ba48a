//! Invalidation Bus
//!
//! Broadcasts purge and configuration events between every process that
//! shares a cache. Each message carries the publisher's instance id.
//! A publisher has already applied the event locally before announcing it,
//! so it skips its own messages. Receivers apply events locally and never
//! re-publish them, which rules out broadcast loops.
//!
//! ```text
//!  worker 1                       transport                    worker 2
//!  ────────                       ─────────                    ────────
//!  evict(local) ──announce──▶  {origin: w1, event}  ──▶  evict(local only)
//!                              (w1 ignores its own)
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::events::{EdgeEvent, PurgeSelector};
use crate::error::{Error, Result};

/// Delay before re-subscribing after the transport drops
pub const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);

/// Stream of raw messages received from a transport
pub type BusStream = BoxStream<'static, String>;

/// Message transport under the bus
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Publish a raw message to every subscriber
    async fn publish(&self, payload: String) -> Result<()>;

    /// Open a subscription; the stream ends when the transport drops
    async fn subscribe(&self) -> Result<BusStream>;
}

// =============================================================================
// Local Transport
// =============================================================================

/// In-process transport over a broadcast channel
#[derive(Debug, Clone)]
pub struct LocalTransport {
    sender: broadcast::Sender<String>,
}

impl LocalTransport {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusTransport for LocalTransport {
    async fn publish(&self, payload: String) -> Result<()> {
        // No subscribers is not an error
        let _ = self.sender.send(payload);
        Ok(())
    }

    async fn subscribe(&self) -> Result<BusStream> {
        let rx = self.sender.subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => return Some((msg, rx)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Local bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

// =============================================================================
// Envelope
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    origin: Uuid,
    event: EdgeEvent,
}

// =============================================================================
// Invalidation Bus
// =============================================================================

type PurgeHandler = Arc<dyn Fn(PurgeSelector) -> BoxFuture<'static, ()> + Send + Sync>;
type ConfigHandler = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct Handlers {
    purge: Vec<PurgeHandler>,
    config: Vec<ConfigHandler>,
}

/// Cross-process event bus
pub struct InvalidationBus {
    transport: Arc<dyn BusTransport>,
    instance: Uuid,
    handlers: RwLock<Handlers>,
}

impl InvalidationBus {
    pub fn new(transport: Arc<dyn BusTransport>) -> Self {
        Self {
            transport,
            instance: Uuid::new_v4(),
            handlers: RwLock::new(Handlers::default()),
        }
    }

    /// Identity stamped on messages from this process
    pub fn instance(&self) -> Uuid {
        self.instance
    }

    /// Register a handler for purges announced by other processes
    pub fn on_purge<F>(&self, handler: F)
    where
        F: Fn(PurgeSelector) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.handlers.write().purge.push(Arc::new(handler));
    }

    /// Register a handler for configuration changes announced by other processes
    pub fn on_config_change<F>(&self, handler: F)
    where
        F: Fn(String) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.handlers.write().config.push(Arc::new(handler));
    }

    /// Announce a purge already applied locally
    pub async fn announce_purge(&self, selector: PurgeSelector) -> Result<()> {
        self.publish(EdgeEvent::Purge { selector }).await
    }

    /// Announce a tenant configuration change already applied locally
    pub async fn announce_config_change(&self, hostname: &str) -> Result<()> {
        self.publish(EdgeEvent::ConfigChanged {
            hostname: hostname.to_string(),
        })
        .await
    }

    async fn publish(&self, event: EdgeEvent) -> Result<()> {
        let payload = serde_json::to_string(&Envelope {
            origin: self.instance,
            event,
        })?;
        self.transport.publish(payload).await
    }

    /// Open the subscription; returns once subscribed so callers know the
    /// bus is live. Received events are dispatched until `shutdown`.
    pub async fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let stream = self.transport.subscribe().await?;
        let bus = Arc::clone(self);
        tokio::spawn(async move { bus.run(Some(stream), shutdown).await });
        Ok(())
    }

    /// Subscribe (retrying) and dispatch until `shutdown`
    pub async fn run(self: Arc<Self>, mut stream: Option<BusStream>, shutdown: CancellationToken) {
        loop {
            let mut active = match stream.take() {
                Some(s) => s,
                None => match self.transport.subscribe().await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(error = %e, "Bus subscribe failed, retrying");
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => continue,
                        }
                    }
                },
            };

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    msg = active.next() => match msg {
                        Some(payload) => self.dispatch(&payload).await,
                        None => {
                            tracing::warn!("Bus subscription closed, resubscribing");
                            break;
                        }
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
            }
        }
    }

    /// Handle one raw message
    async fn dispatch(&self, payload: &str) {
        let envelope: Envelope = match serde_json::from_str(payload) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(error = %Error::from(e), "Ignoring malformed bus message");
                return;
            }
        };
        if envelope.origin == self.instance {
            return;
        }

        match envelope.event {
            EdgeEvent::Purge { selector } => {
                tracing::debug!(%selector, from = %envelope.origin, "Applying remote purge");
                let handlers = self.handlers.read().purge.clone();
                for handler in handlers {
                    handler(selector.clone()).await;
                }
            }
            EdgeEvent::ConfigChanged { hostname } => {
                tracing::debug!(%hostname, from = %envelope.origin, "Applying remote config change");
                let handlers = self.handlers.read().config.clone();
                for handler in handlers {
                    handler(hostname.clone()).await;
                }
            }
        }
    }
}

impl std::fmt::Debug for InvalidationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read();
        f.debug_struct("InvalidationBus")
            .field("instance", &self.instance)
            .field("purge_handlers", &handlers.purge.len())
            .field("config_handlers", &handlers.config.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use parking_lot::Mutex;

    fn recording_bus(transport: Arc<LocalTransport>) -> (Arc<InvalidationBus>, Arc<Mutex<Vec<PurgeSelector>>>) {
        let bus = Arc::new(InvalidationBus::new(transport));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.on_purge(move |selector| {
            let sink = sink.clone();
            async move { sink.lock().push(selector) }.boxed()
        });
        (bus, seen)
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_purge_reaches_peers_but_not_self() {
        let transport = Arc::new(LocalTransport::new());
        let (a, seen_a) = recording_bus(transport.clone());
        let (b, seen_b) = recording_bus(transport.clone());
        let shutdown = CancellationToken::new();
        a.start(shutdown.clone()).await.unwrap();
        b.start(shutdown.clone()).await.unwrap();

        let selector = PurgeSelector::resource("example.com", "/x");
        a.announce_purge(selector.clone()).await.unwrap();

        wait_for(|| !seen_b.lock().is_empty()).await;
        assert_eq!(*seen_b.lock(), vec![selector]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(seen_a.lock().is_empty());

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_receivers_do_not_republish() {
        let transport = Arc::new(LocalTransport::new());
        let (a, _) = recording_bus(transport.clone());
        let (b, seen_b) = recording_bus(transport.clone());
        let (c, seen_c) = recording_bus(transport.clone());
        let shutdown = CancellationToken::new();
        for bus in [&a, &b, &c] {
            bus.start(shutdown.clone()).await.unwrap();
        }

        a.announce_purge(PurgeSelector::All).await.unwrap();
        wait_for(|| !seen_b.lock().is_empty() && !seen_c.lock().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Exactly one delivery each; nobody echoed the event
        assert_eq!(seen_b.lock().len(), 1);
        assert_eq!(seen_c.lock().len(), 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_config_change_and_malformed_messages() {
        let transport = Arc::new(LocalTransport::new());
        let a = Arc::new(InvalidationBus::new(transport.clone()));
        let b = Arc::new(InvalidationBus::new(transport.clone()));
        let hosts = Arc::new(Mutex::new(Vec::new()));
        let sink = hosts.clone();
        b.on_config_change(move |host| {
            let sink = sink.clone();
            async move { sink.lock().push(host) }.boxed()
        });
        let shutdown = CancellationToken::new();
        b.start(shutdown.clone()).await.unwrap();

        transport.publish("not json".into()).await.unwrap();
        a.announce_config_change("shop.test").await.unwrap();

        wait_for(|| !hosts.lock().is_empty()).await;
        assert_eq!(*hosts.lock(), vec!["shop.test".to_string()]);
        shutdown.cancel();
    }
}
