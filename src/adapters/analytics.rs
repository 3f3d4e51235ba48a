//! Traffic Analytics Adapter
//!
//! Implements the `TrafficRecorder` port with in-memory counters:
//! global totals, per-domain totals and a rolling per-minute history.
//! The state is persisted as JSON; every process writes its own file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::domain::ports::{RequestOutcome, TrafficRecorder};
use crate::error::Result;

/// Number of per-minute history points retained
pub const HISTORY_LIMIT: usize = 60;

/// Counters shared by the global, per-domain and per-minute views
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Counters {
    pub total_requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub blocked: u64,
    pub bandwidth: u64,
}

impl Counters {
    fn record(&mut self, outcome: RequestOutcome) {
        self.total_requests += 1;
        match outcome {
            RequestOutcome::Hit => self.hits += 1,
            RequestOutcome::Miss => self.misses += 1,
            RequestOutcome::Error => self.errors += 1,
            RequestOutcome::Blocked => self.blocked += 1,
        }
    }

    /// Hit ratio over hits and misses
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }

    fn add(&mut self, other: &Counters) {
        self.total_requests += other.total_requests;
        self.hits += other.hits;
        self.misses += other.misses;
        self.errors += other.errors;
        self.blocked += other.blocked;
        self.bandwidth += other.bandwidth;
    }
}

/// One minute of traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPoint {
    /// Start of the minute (epoch milliseconds)
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub counters: Counters,
}

/// Serializable analytics state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatsSnapshot {
    #[serde(flatten)]
    pub totals: Counters,
    pub domains: BTreeMap<String, Counters>,
    pub history: Vec<HistoryPoint>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub last_update: Option<DateTime<Utc>>,
}

impl StatsSnapshot {
    /// Fold another process's snapshot into this one
    pub fn merge(&mut self, other: &StatsSnapshot) {
        self.totals.add(&other.totals);
        for (domain, counters) in &other.domains {
            self.domains.entry(domain.clone()).or_default().add(counters);
        }

        let mut minutes: BTreeMap<DateTime<Utc>, Counters> = self
            .history
            .drain(..)
            .map(|p| (p.timestamp, p.counters))
            .collect();
        for point in &other.history {
            minutes.entry(point.timestamp).or_default().add(&point.counters);
        }
        let skip = minutes.len().saturating_sub(HISTORY_LIMIT);
        self.history = minutes
            .into_iter()
            .skip(skip)
            .map(|(timestamp, counters)| HistoryPoint { timestamp, counters })
            .collect();

        self.last_update = self.last_update.max(other.last_update);
    }
}

/// Combine the per-worker files of `workers` workers into `path`
pub async fn aggregate_worker_stats(path: &Path, workers: usize) -> Result<StatsSnapshot> {
    let mut combined = StatsSnapshot::default();
    for id in 1..=workers {
        let worker_path = process_stats_path(path, Some(id));
        if let Ok(raw) = tokio::fs::read(&worker_path).await {
            match serde_json::from_slice::<StatsSnapshot>(&raw) {
                Ok(snapshot) => combined.merge(&snapshot),
                Err(e) => {
                    tracing::warn!(path = %worker_path.display(), error = %e, "Skipping unreadable worker analytics")
                }
            }
        }
    }
    combined.last_update = Some(Utc::now());
    tokio::fs::write(path, serde_json::to_vec_pretty(&combined)?).await?;
    Ok(combined)
}

/// In-memory traffic statistics
#[derive(Debug, Default)]
pub struct TrafficStats {
    state: Mutex<StatsSnapshot>,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load persisted state, starting empty when the file is missing or unreadable
    pub fn load(path: &Path) -> Self {
        let state = match std::fs::read(path) {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "Failed to load analytics, starting fresh");
                StatsSnapshot::default()
            }),
            Err(_) => StatsSnapshot::default(),
        };
        Self {
            state: Mutex::new(state),
        }
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> StatsSnapshot {
        self.state.lock().clone()
    }

    /// Write the current state to `path`
    pub async fn persist(&self, path: &Path) -> Result<()> {
        let json = {
            let mut state = self.state.lock();
            state.last_update = Some(Utc::now());
            serde_json::to_vec_pretty(&*state)?
        };
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    fn with_minute<F: FnOnce(&mut Counters)>(state: &mut StatsSnapshot, now: DateTime<Utc>, f: F) {
        let minute = now.timestamp() - now.timestamp().rem_euclid(60);
        let bucket = DateTime::from_timestamp(minute, 0).unwrap_or(now);

        let needs_point = state.history.last().map(|p| p.timestamp) != Some(bucket);
        if needs_point {
            state.history.push(HistoryPoint {
                timestamp: bucket,
                counters: Counters::default(),
            });
            if state.history.len() > HISTORY_LIMIT {
                let excess = state.history.len() - HISTORY_LIMIT;
                state.history.drain(..excess);
            }
        }
        if let Some(point) = state.history.last_mut() {
            f(&mut point.counters);
        }
    }
}

impl TrafficRecorder for TrafficStats {
    fn record_request(&self, outcome: RequestOutcome, hostname: &str) {
        let mut state = self.state.lock();
        state.totals.record(outcome);
        state
            .domains
            .entry(hostname.to_string())
            .or_default()
            .record(outcome);
        Self::with_minute(&mut state, Utc::now(), |c| c.record(outcome));
    }

    fn record_bandwidth(&self, bytes: u64, hostname: &str) {
        let mut state = self.state.lock();
        state.totals.bandwidth += bytes;
        state
            .domains
            .entry(hostname.to_string())
            .or_default()
            .bandwidth += bytes;
        Self::with_minute(&mut state, Utc::now(), |c| c.bandwidth += bytes);
    }
}

/// Per-process analytics file: the primary uses `path` as-is, worker `n`
/// writes `<stem>.worker-<n>.<ext>` next to it.
pub fn process_stats_path(path: &Path, worker: Option<usize>) -> PathBuf {
    let Some(id) = worker else {
        return path.to_path_buf();
    };
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("analytics");
    let file = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}.worker-{}.{}", stem, id, ext),
        None => format!("{}.worker-{}", stem, id),
    };
    path.with_file_name(file)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_totals_and_domains() {
        let stats = TrafficStats::new();
        stats.record_request(RequestOutcome::Hit, "a.test");
        stats.record_request(RequestOutcome::Miss, "a.test");
        stats.record_request(RequestOutcome::Blocked, "b.test");
        stats.record_bandwidth(500, "a.test");

        let snap = stats.snapshot();
        assert_eq!(snap.totals.total_requests, 3);
        assert_eq!(snap.totals.hits, 1);
        assert_eq!(snap.totals.blocked, 1);
        assert_eq!(snap.totals.bandwidth, 500);
        assert_eq!(snap.domains["a.test"].total_requests, 2);
        assert_eq!(snap.domains["a.test"].bandwidth, 500);
        assert!((snap.domains["a.test"].hit_ratio() - 0.5).abs() < f64::EPSILON);
        assert!(!snap.history.is_empty());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut state = StatsSnapshot::default();
        let start = Utc::now();
        for i in 0..(HISTORY_LIMIT as i64 + 15) {
            let t = start + chrono::Duration::minutes(i);
            TrafficStats::with_minute(&mut state, t, |c| c.hits += 1);
        }
        assert_eq!(state.history.len(), HISTORY_LIMIT);

        // Same minute reuses the point
        let last = state.history.last().unwrap().timestamp;
        TrafficStats::with_minute(&mut state, last, |c| c.hits += 1);
        assert_eq!(state.history.len(), HISTORY_LIMIT);
        assert_eq!(state.history.last().unwrap().counters.hits, 2);
    }

    #[tokio::test]
    async fn test_persist_and_load() {
        let path = std::env::temp_dir().join(format!("pravah-stats-{}.json", uuid::Uuid::new_v4()));
        let stats = TrafficStats::new();
        stats.record_request(RequestOutcome::Error, "c.test");
        stats.persist(&path).await.unwrap();

        let loaded = TrafficStats::load(&path);
        let snap = loaded.snapshot();
        assert_eq!(snap.totals.errors, 1);
        assert!(snap.last_update.is_some());

        let json: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["totalRequests"], 1);
        assert_eq!(json["domains"]["c.test"]["errors"], 1);
    }

    #[tokio::test]
    async fn test_aggregate_worker_stats() {
        let dir = std::env::temp_dir().join(format!("pravah-agg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("analytics.json");

        for (id, host) in [(1, "a.test"), (2, "a.test"), (3, "b.test")] {
            let stats = TrafficStats::new();
            stats.record_request(RequestOutcome::Hit, host);
            stats.record_bandwidth(10, host);
            stats.persist(&process_stats_path(&path, Some(id))).await.unwrap();
        }

        // Worker 4 never wrote a file
        let combined = aggregate_worker_stats(&path, 4).await.unwrap();
        assert_eq!(combined.totals.hits, 3);
        assert_eq!(combined.totals.bandwidth, 30);
        assert_eq!(combined.domains["a.test"].hits, 2);
        assert!(combined.history.len() <= 2);

        let on_disk: StatsSnapshot = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk.totals.total_requests, 3);
    }

    #[test]
    fn test_process_stats_path() {
        let base = Path::new("/var/lib/pravah/analytics.json");
        assert_eq!(process_stats_path(base, None), base);
        assert_eq!(
            process_stats_path(base, Some(3)),
            Path::new("/var/lib/pravah/analytics.worker-3.json")
        );
    }
}
