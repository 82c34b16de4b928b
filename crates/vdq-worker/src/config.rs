//! Worker configuration.

use std::str::FromStr;
use std::time::Duration;

use vdq_queue::MIN_TIMER_PERIOD;

/// Bounds on how often one key may be attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Per-lineage cap on `attempt`
    pub max_attempts: u32,
    /// Per-key cap on ledger count inside one window
    pub max_url_retries: u64,
    /// Ledger entry lifetime
    pub retry_ttl: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            max_url_retries: 5,
            retry_ttl: Duration::from_secs(86_400), // 1 day
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub retry: RetryPolicy,
    /// Smallest stored object that counts as a finished artifact
    pub min_valid_size: u64,
    /// Artifacts older than this are swept
    pub retention_ttl: Duration,
    /// Time between sweeps
    pub sweep_interval: Duration,
    pub sweep_enabled: bool,
    /// Lifetime of download links sent to clients
    pub presign_expiry: Duration,
    /// Work directory for staging files
    pub work_dir: String,
    /// Upper bound on one extraction
    pub fetch_timeout: Duration,
    /// Prometheus listen address; metrics export is off when unset
    pub metrics_addr: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            min_valid_size: 1024 * 1024, // 1 MiB
            retention_ttl: Duration::from_secs(7200), // 2 hours
            sweep_interval: Duration::from_secs(3600),
            sweep_enabled: true,
            presign_expiry: Duration::from_secs(7200),
            work_dir: "/tmp/vdq".to_string(),
            fetch_timeout: Duration::from_secs(3600),
            metrics_addr: None,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(env_or(name, default))
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            retry: RetryPolicy {
                max_attempts: env_or("MAX_ATTEMPTS", defaults.retry.max_attempts),
                max_url_retries: env_or("MAX_URL_RETRIES", defaults.retry.max_url_retries),
                retry_ttl: env_secs("RETRY_TTL", defaults.retry.retry_ttl.as_secs()),
            },
            min_valid_size: env_or("MIN_VALID_SIZE", defaults.min_valid_size),
            retention_ttl: env_secs("RETENTION_TTL", defaults.retention_ttl.as_secs()),
            sweep_interval: env_secs("SWEEP_INTERVAL", defaults.sweep_interval.as_secs())
                .max(MIN_TIMER_PERIOD),
            sweep_enabled: std::env::var("SWEEP_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.sweep_enabled),
            presign_expiry: env_secs("PRESIGN_EXPIRY", defaults.presign_expiry.as_secs()),
            work_dir: std::env::var("WORKER_WORK_DIR").unwrap_or(defaults.work_dir),
            fetch_timeout: env_secs("WORKER_FETCH_TIMEOUT", defaults.fetch_timeout.as_secs()),
            metrics_addr: std::env::var("METRICS_ADDR").ok().filter(|v| !v.is_empty()),
        }
    }
}
