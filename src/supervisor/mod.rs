//! Process Supervisor
//!
//! The primary process does not serve requests. It starts a fixed pool of
//! workers, replaces any worker that exits unexpectedly, and coordinates
//! shutdown:
//!
//! ```text
//!             spawn                 exit (unexpected)
//!   ┌──────────────────▶ serving ──────────────────────┐
//!   │                      │                           │
//!   │                      │ Drain                     │ respawn
//!   │                      ▼                           │
//!   │                  draining ──▶ exited             │
//!   └──────────────────────────────────────────────────┘
//! ```
//!
//! Shutdown order: final durable-tier sweep, persist state, send `Drain` to
//! every worker, wait up to `shutdown_timeout`, kill whatever is left.
//! A replacement that fails to launch is retried every `respawn_backoff`
//! while the rest of the pool keeps running.

pub mod launcher;
pub mod worker;

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub use launcher::{ProcessLauncher, TaskLauncher, WorkerHandle, WorkerLauncher};

/// Default time the primary waits for workers to drain
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default delay before retrying a replacement that failed to launch
pub const DEFAULT_RESPAWN_BACKOFF: Duration = Duration::from_secs(1);

// =============================================================================
// Control Channel
// =============================================================================

/// Message sent from the primary to a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ControlMessage {
    /// Stop accepting, finish in-flight requests, exit
    Drain,
    /// Exit immediately
    Shutdown,
}

/// Report sent when a worker exits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub id: usize,
    pub pid: Option<u32>,
    /// Exit code, `None` when killed by a signal or never started
    pub code: Option<i32>,
}

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Number of workers kept running
    pub workers: usize,
    pub shutdown_timeout: Duration,
    pub respawn_backoff: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(4);
        Self {
            workers,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            respawn_backoff: DEFAULT_RESPAWN_BACKOFF,
        }
    }
}

/// How shutdown ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every worker exited within the timeout
    Clean,
    /// Some workers were killed
    Forced,
}

// =============================================================================
// Supervisor
// =============================================================================

/// Owns the worker pool; nothing else starts or stops workers
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    launcher: Arc<dyn WorkerLauncher>,
    workers: BTreeMap<usize, WorkerHandle>,
    /// Worker ids whose replacement failed to launch
    respawn_queue: BTreeSet<usize>,
    exits_tx: mpsc::UnboundedSender<WorkerExit>,
    exits_rx: mpsc::UnboundedReceiver<WorkerExit>,
    restarts: u64,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        Self {
            config,
            launcher,
            workers: BTreeMap::new(),
            respawn_queue: BTreeSet::new(),
            exits_tx,
            exits_rx,
            restarts: 0,
        }
    }

    /// Start the full pool
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(workers = self.config.workers, "Starting worker pool");
        for id in 1..=self.config.workers {
            self.spawn(id).await?;
        }
        Ok(())
    }

    async fn spawn(&mut self, id: usize) -> Result<()> {
        let handle = self.launcher.launch(id, self.exits_tx.clone()).await?;
        tracing::info!(worker = id, pid = ?handle.pid(), "Worker started");
        self.workers.insert(id, handle);
        Ok(())
    }

    /// Keep the pool full until `stop` fires
    pub async fn run(&mut self, stop: CancellationToken) -> Result<()> {
        loop {
            let backoff = self.config.respawn_backoff;
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                exit = self.exits_rx.recv() => {
                    let Some(exit) = exit else { return Ok(()) };
                    self.workers.remove(&exit.id);
                    self.restarts += 1;
                    tracing::warn!(worker = exit.id, pid = ?exit.pid, code = ?exit.code, "Worker died, starting a replacement");
                    self.respawn(exit.id).await;
                }
                _ = tokio::time::sleep(backoff), if !self.respawn_queue.is_empty() => {
                    let ids: Vec<usize> = std::mem::take(&mut self.respawn_queue).into_iter().collect();
                    for id in ids {
                        self.respawn(id).await;
                    }
                }
            }
        }
    }

    /// Start a replacement; a launch failure is queued for retry
    async fn respawn(&mut self, id: usize) {
        if let Err(e) = self.spawn(id).await {
            tracing::error!(worker = id, error = %e, retry_in = ?self.config.respawn_backoff, "Failed to start replacement worker");
            self.respawn_queue.insert(id);
        }
    }

    /// Coordinated shutdown; `before_drain` runs first (final sweep, state persistence)
    pub async fn shutdown<F>(&mut self, before_drain: F) -> ShutdownOutcome
    where
        F: Future<Output = ()>,
    {
        before_drain.await;

        tracing::info!(workers = self.workers.len(), "Asking workers to drain");
        for handle in self.workers.values() {
            if let Err(e) = handle.send(ControlMessage::Drain) {
                tracing::warn!(worker = handle.id(), error = %e, "Failed to signal worker");
            }
        }

        let deadline = tokio::time::sleep(self.config.shutdown_timeout);
        tokio::pin!(deadline);

        while !self.workers.is_empty() {
            tokio::select! {
                exit = self.exits_rx.recv() => {
                    let Some(exit) = exit else { break };
                    tracing::info!(worker = exit.id, code = ?exit.code, "Worker exited");
                    self.workers.remove(&exit.id);
                }
                _ = &mut deadline => {
                    tracing::warn!(remaining = self.workers.len(), "Workers did not drain in time, killing");
                    for handle in self.workers.values() {
                        handle.kill();
                    }
                    self.workers.clear();
                    return ShutdownOutcome::Forced;
                }
            }
        }
        ShutdownOutcome::Clean
    }

    /// Number of live workers
    pub fn live(&self) -> usize {
        self.workers.len()
    }

    /// Workers waiting for a replacement launch retry
    pub fn pending_respawns(&self) -> usize {
        self.respawn_queue.len()
    }

    /// Replacements started since launch
    pub fn restarts(&self) -> u64 {
        self.restarts
    }
}

/// Resolves on SIGINT or SIGTERM
pub async fn termination_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// =============================================================================
// Tests
// =============================================================================
