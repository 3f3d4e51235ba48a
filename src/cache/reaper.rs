//! Cache Reaper - periodic durable-tier garbage collection
//!
//! Runs in exactly one process per host (the supervisor, or the single
//! process in standalone mode). A sweep:
//!
//! 1. removes every metadata record whose `expiresAt` has passed, with its body
//! 2. removes every unparseable metadata record, with its body
//! 3. removes every body record that has no metadata record (crash mid-write)
//!
//! Per-file failures are logged and never abort the sweep. Files whose names
//! are not cache-key addresses are left alone.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::durable::{DurableTier, META_SUFFIX};
use super::key::CacheKey;

/// Default sweep period (10 minutes)
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(600);

/// Result of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Expired entries removed
    pub expired: usize,
    /// Corrupt metadata records removed
    pub corrupt: usize,
    /// Orphan body records removed
    pub orphans: usize,
    /// Files that could not be processed
    pub errors: usize,
}

impl SweepReport {
    /// Entries removed by this sweep
    pub fn removed(&self) -> usize {
        self.expired + self.corrupt + self.orphans
    }
}

/// Durable-tier sweeper
#[derive(Debug, Clone)]
pub struct CacheReaper {
    tier: DurableTier,
}

impl CacheReaper {
    pub fn new(tier: DurableTier) -> Self {
        Self { tier }
    }

    /// Run one full sweep of the durable tier
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        let files = match self.tier.list_files().await {
            Ok(files) => files,
            Err(e) => {
                tracing::error!(dir = %self.tier.dir().display(), error = %e, "Cache reaper could not list directory");
                report.errors += 1;
                return report;
            }
        };

        let now = Utc::now();
        let mut live_meta: HashSet<String> = HashSet::new();
        let mut bodies = Vec::new();

        for name in &files {
            let Some(stem) = name.strip_suffix(META_SUFFIX) else {
                if CacheKey::from_hex(name).is_some() {
                    bodies.push(name.as_str());
                }
                continue;
            };
            if CacheKey::from_hex(stem).is_none() {
                continue;
            }

            match self.tier.read_metadata_file(name).await {
                Ok(meta) if meta.is_expired_at(now) => {
                    if self.remove_pair(stem, name, &mut report).await {
                        report.expired += 1;
                    }
                }
                Ok(_) => {
                    live_meta.insert(stem.to_string());
                }
                Err(crate::error::Error::CorruptCacheRecord { reason, .. }) => {
                    tracing::debug!(file = %name, %reason, "Removing corrupt metadata record");
                    if self.remove_pair(stem, name, &mut report).await {
                        report.corrupt += 1;
                    }
                }
                Err(e) => {
                    // Removed by a concurrent purge, or unreadable
                    tracing::debug!(file = %name, error = %e, "Skipping metadata record");
                    live_meta.insert(stem.to_string());
                }
            }
        }

        for body in bodies {
            if live_meta.contains(body) {
                continue;
            }
            // Metadata may have been written after the listing was taken
            if self.has_metadata(body).await {
                continue;
            }
            match self.tier.remove_file(body).await {
                Ok(true) => report.orphans += 1,
                Ok(false) => {}
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(file = %body, error = %e, "Failed to remove orphan body");
                }
            }
        }

        if report.removed() > 0 || report.errors > 0 {
            tracing::info!(
                expired = report.expired,
                corrupt = report.corrupt,
                orphans = report.orphans,
                errors = report.errors,
                "Cache reaper sweep complete"
            );
        } else {
            tracing::debug!("Cache reaper sweep complete, nothing to remove");
        }
        report
    }

    /// Sweep once now, then every `interval` until cancelled
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("Cache reaper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    /// Whether the metadata record for body file `body` exists now
    async fn has_metadata(&self, body: &str) -> bool {
        let meta = self.tier.dir().join(format!("{}{}", body, META_SUFFIX));
        tokio::fs::try_exists(&meta).await.unwrap_or(false)
    }

    async fn remove_pair(&self, stem: &str, meta: &str, report: &mut SweepReport) -> bool {
        let mut ok = true;
        for file in [stem, meta] {
            if let Err(e) = self.tier.remove_file(file).await {
                report.errors += 1;
                ok = false;
                tracing::warn!(%file, error = %e, "Cache reaper failed to remove file");
            }
        }
        ok
    }
}

// =============================================================================
// Tests
// =============================================================================
