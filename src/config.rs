//! Configuration
//!
//! Command-line flags (with environment fallbacks) and their typed,
//! validated form. The supervisor starts workers with the same flags plus
//! the hidden `worker --id <n>` subcommand, so every process derives an
//! identical [`EdgeConfig`].

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::admission::AdmissionConfig;
use crate::error::{Error, Result};
use crate::proxy::compression::CompressionConfig;
use crate::proxy::origin::OriginConfig;
use crate::proxy::server::ServerConfig;
use crate::supervisor::SupervisorConfig;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Pravah - multi-tenant CDN edge node
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Listening port shared by every worker
    #[arg(long, env = "PORT", default_value = "5000")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Durable cache directory
    #[arg(long, env = "CACHE_DIR", default_value = "./cache-data")]
    pub cache_dir: PathBuf,

    /// TTL in seconds when the origin sends no max-age
    #[arg(long, env = "DEFAULT_TTL", default_value = "3600")]
    pub default_ttl: u64,

    /// Disable response compression
    #[arg(long, env = "NO_COMPRESSION")]
    pub no_compression: bool,

    /// Serve from a single process instead of a supervised worker pool
    #[arg(long, env = "NO_CLUSTER")]
    pub no_cluster: bool,

    /// Maximum number of worker processes (capped at available parallelism)
    #[arg(long, env = "MAX_WORKERS", default_value = "4")]
    pub max_workers: usize,

    /// Rate-limit window in milliseconds
    #[arg(long, env = "RATE_LIMIT_WINDOW_MS", default_value = "900000")]
    pub rate_limit_window_ms: u64,

    /// Requests admitted per identity per window
    #[arg(long, env = "RATE_LIMIT_MAX", default_value = "100")]
    pub rate_limit_max: u64,

    /// Redis URL for the hot tier, shared rate limits and the invalidation bus
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Per-command Redis timeout in milliseconds
    #[arg(long, env = "REDIS_TIMEOUT_MS", default_value = "250")]
    pub redis_timeout_ms: u64,

    /// Tenant configuration file
    #[arg(long, env = "DOMAINS_FILE", default_value = "./domains.json")]
    pub domains_file: PathBuf,

    /// Analytics snapshot file
    #[arg(long, env = "ANALYTICS_FILE", default_value = "./analytics.json")]
    pub analytics_file: PathBuf,

    /// Bearer token required by the admin API (open when unset)
    #[arg(long, env = "ADMIN_TOKEN", hide_env_values = true)]
    pub admin_token: Option<String>,

    /// Seconds between durable-tier sweeps
    #[arg(long, env = "REAP_INTERVAL_SECS", default_value = "600")]
    pub reap_interval_secs: u64,

    /// Seconds a draining worker waits for in-flight requests
    #[arg(long, env = "WORKER_DRAIN_TIMEOUT_SECS", default_value = "5")]
    pub worker_drain_timeout_secs: u64,

    /// Seconds the primary waits for workers before force-exiting
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value = "10")]
    pub shutdown_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run as a supervised worker (started by the primary)
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        id: usize,
    },
}

// =============================================================================
// Typed Configuration
// =============================================================================

/// Cache settings
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub reap_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./cache-data"),
            reap_interval: crate::cache::reaper::DEFAULT_REAP_INTERVAL,
        }
    }
}

/// Redis settings
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub timeout: Duration,
}

/// Complete node configuration
#[derive(Debug, Clone, Default)]
pub struct EdgeConfig {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub origin: OriginConfig,
    pub compression: CompressionConfig,
    pub admission: AdmissionConfig,
    pub supervisor: SupervisorConfig,
    pub redis: Option<RedisConfig>,
    pub domains_file: Option<PathBuf>,
    pub analytics_file: Option<PathBuf>,
    pub admin_token: Option<String>,
}

impl EdgeConfig {
    /// Validate CLI arguments into a configuration
    pub fn from_args(args: &Args) -> Result<Self> {
        if args.max_workers == 0 {
            return Err(Error::Config("--max-workers must be at least 1".into()));
        }
        if args.rate_limit_window_ms == 0 || args.rate_limit_max == 0 {
            return Err(Error::Config("rate-limit window and max must be positive".into()));
        }
        if args.reap_interval_secs == 0 {
            return Err(Error::Config("--reap-interval-secs must be positive".into()));
        }

        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Ok(Self {
            server: ServerConfig {
                bind: args.bind,
                port: args.port,
                drain_timeout: Duration::from_secs(args.worker_drain_timeout_secs),
            },
            cache: CacheConfig {
                dir: args.cache_dir.clone(),
                reap_interval: Duration::from_secs(args.reap_interval_secs),
            },
            origin: OriginConfig {
                default_ttl: Duration::from_secs(args.default_ttl),
                ..OriginConfig::default()
            },
            compression: CompressionConfig {
                enabled: !args.no_compression,
                ..CompressionConfig::default()
            },
            admission: AdmissionConfig {
                window: Duration::from_millis(args.rate_limit_window_ms),
                max_requests: args.rate_limit_max,
            },
            supervisor: SupervisorConfig {
                workers: args.max_workers.min(parallelism).max(1),
                shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
                ..SupervisorConfig::default()
            },
            redis: args
                .redis_url
                .as_ref()
                .filter(|u| !u.trim().is_empty())
                .map(|url| RedisConfig {
                    url: url.clone(),
                    timeout: Duration::from_millis(args.redis_timeout_ms),
                }),
            domains_file: Some(args.domains_file.clone()),
            analytics_file: Some(args.analytics_file.clone()),
            admin_token: args.admin_token.clone().filter(|t| !t.is_empty()),
        })
    }

    /// Flags to hand to worker processes: everything but the subcommand
    pub fn worker_args() -> Vec<String> {
        let mut args: Vec<String> = std::env::args().skip(1).collect();
        if let Some(pos) = args.iter().position(|a| a == "worker") {
            args.truncate(pos);
        }
        args
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["pravah"]);
        let config = EdgeConfig::from_args(&args).unwrap();

        assert_eq!(config.server.port, 5000);
        assert_eq!(config.origin.default_ttl, Duration::from_secs(3600));
        assert_eq!(config.admission.window, Duration::from_millis(900_000));
        assert_eq!(config.admission.max_requests, 100);
        assert!(config.compression.enabled);
        assert!(config.redis.is_none());
        assert!(config.supervisor.workers >= 1 && config.supervisor.workers <= 4);
        assert_eq!(config.supervisor.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(config.server.drain_timeout, Duration::from_secs(5));
        assert_eq!(args.command, None);
    }

    #[test]
    fn test_worker_subcommand() {
        let args = Args::parse_from(["pravah", "--port", "8080", "--no-compression", "worker", "--id", "3"]);
        assert_eq!(args.command, Some(Command::Worker { id: 3 }));

        let config = EdgeConfig::from_args(&args).unwrap();
        assert_eq!(config.server.port, 8080);
        assert!(!config.compression.enabled);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let args = Args::parse_from(["pravah", "--max-workers", "0"]);
        assert_matches!(EdgeConfig::from_args(&args), Err(Error::Config(_)));

        let args = Args::parse_from(["pravah", "--rate-limit-max", "0"]);
        assert_matches!(EdgeConfig::from_args(&args), Err(Error::Config(_)));
    }

    #[test]
    fn test_redis_url() {
        let args = Args::parse_from(["pravah", "--redis-url", "redis://cache:6379", "--redis-timeout-ms", "100"]);
        let redis = EdgeConfig::from_args(&args).unwrap().redis.unwrap();
        assert_eq!(redis.url, "redis://cache:6379");
        assert_eq!(redis.timeout, Duration::from_millis(100));
    }
}
