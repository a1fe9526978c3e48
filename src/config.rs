//! Runtime configuration for a worker instance.
//!
//! All durations are stored as plain unit-suffixed integers so the struct can
//! be deserialized from any serde source. [`WorkerConfig::from_env`] reads the
//! same fields from `JOBS_*` environment variables.

use crate::errors::ConfigError;
use crate::retry::RetryPolicy;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

/// The logical role elected through the lease table by default.
pub const DEFAULT_WORKER_NAME: &str = "job-dispatcher";

/// Tuning knobs for lease election, polling, execution and recovery.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Lease row to contend for. Instances sharing it elect one dispatcher.
    pub worker_name: String,
    /// Lease lifetime after each acquisition or renewal (ms)
    pub lease_ttl_ms: u64,
    /// Renewal cadence, also the retry cadence while another instance holds the lease (ms)
    pub heartbeat_interval_ms: u64,
    /// Sleep between polls when nothing was claimed (ms)
    pub poll_interval_ms: u64,
    /// Upper bound of the random jitter added to each poll sleep (ms)
    pub poll_jitter_ms: u64,
    /// Jobs claimed per poll
    pub batch_size: u32,
    /// Hard ceiling on a single handler execution (ms)
    pub job_timeout_ms: u64,
    /// How often a running job refreshes its `updated_at` (ms)
    pub job_heartbeat_ms: u64,
    /// A `processing` job untouched for this long is considered abandoned (ms)
    pub stale_after_ms: u64,
    /// Recovery pass cadence while holding the lease (ms)
    pub reclaim_interval_ms: u64,
    /// First pause after a storage failure (ms)
    pub storage_backoff_base_ms: u64,
    /// Longest pause after repeated storage failures (ms)
    pub storage_backoff_max_ms: u64,
    /// Job-level retry policy
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_name: DEFAULT_WORKER_NAME.to_string(),
            lease_ttl_ms: 15_000,
            heartbeat_interval_ms: 5_000,
            poll_interval_ms: 5_000,
            poll_jitter_ms: 100,
            batch_size: 5,
            job_timeout_ms: 120_000,
            job_heartbeat_ms: 30_000,
            stale_after_ms: 300_000,
            reclaim_interval_ms: 60_000,
            storage_backoff_base_ms: 500,
            storage_backoff_max_ms: 30_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    /// Load from `JOBS_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key/value source using the `JOBS_*` names.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            worker_name: lookup("JOBS_WORKER_NAME").unwrap_or(defaults.worker_name),
            lease_ttl_ms: parse(&lookup, "JOBS_LEASE_TTL_MS", defaults.lease_ttl_ms)?,
            heartbeat_interval_ms: parse(
                &lookup,
                "JOBS_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval_ms,
            )?,
            poll_interval_ms: parse(&lookup, "JOBS_POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            poll_jitter_ms: parse(&lookup, "JOBS_POLL_JITTER_MS", defaults.poll_jitter_ms)?,
            batch_size: parse(&lookup, "JOBS_BATCH_SIZE", defaults.batch_size)?,
            job_timeout_ms: parse(&lookup, "JOBS_JOB_TIMEOUT_MS", defaults.job_timeout_ms)?,
            job_heartbeat_ms: parse(&lookup, "JOBS_JOB_HEARTBEAT_MS", defaults.job_heartbeat_ms)?,
            stale_after_ms: parse(&lookup, "JOBS_STALE_AFTER_MS", defaults.stale_after_ms)?,
            reclaim_interval_ms: parse(
                &lookup,
                "JOBS_RECLAIM_INTERVAL_MS",
                defaults.reclaim_interval_ms,
            )?,
            storage_backoff_base_ms: parse(
                &lookup,
                "JOBS_STORAGE_BACKOFF_BASE_MS",
                defaults.storage_backoff_base_ms,
            )?,
            storage_backoff_max_ms: parse(
                &lookup,
                "JOBS_STORAGE_BACKOFF_MAX_MS",
                defaults.storage_backoff_max_ms,
            )?,
            retry: RetryPolicy {
                base_ms: parse(&lookup, "JOBS_RETRY_BASE_MS", defaults.retry.base_ms)?,
                factor: parse(&lookup, "JOBS_RETRY_FACTOR", defaults.retry.factor)?,
                cap_ms: parse(&lookup, "JOBS_RETRY_CAP_MS", defaults.retry.cap_ms)?,
                jitter_ratio: parse(
                    &lookup,
                    "JOBS_RETRY_JITTER_RATIO",
                    defaults.retry.jitter_ratio,
                )?,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the relationships the lease and recovery logic rely on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_name.trim().is_empty() {
            return Err(ConfigError::invalid("worker_name must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size must be at least 1"));
        }
        for (name, value) in [
            ("lease_ttl_ms", self.lease_ttl_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("job_timeout_ms", self.job_timeout_ms),
            ("job_heartbeat_ms", self.job_heartbeat_ms),
            ("reclaim_interval_ms", self.reclaim_interval_ms),
            ("storage_backoff_base_ms", self.storage_backoff_base_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(format_args!("{name} must be positive")));
            }
        }
        // At least two renewals must fit in one TTL.
        if self.heartbeat_interval_ms.saturating_mul(2) >= self.lease_ttl_ms {
            return Err(ConfigError::invalid(format_args!(
                "heartbeat_interval_ms ({}) must be less than half of lease_ttl_ms ({})",
                self.heartbeat_interval_ms, self.lease_ttl_ms
            )));
        }
        // A live job is never older than its timeout, so it can't look abandoned.
        if self.stale_after_ms <= self.job_timeout_ms {
            return Err(ConfigError::invalid(format_args!(
                "stale_after_ms ({}) must exceed job_timeout_ms ({})",
                self.stale_after_ms, self.job_timeout_ms
            )));
        }
        if self.job_heartbeat_ms >= self.stale_after_ms {
            return Err(ConfigError::invalid(format_args!(
                "job_heartbeat_ms ({}) must be below stale_after_ms ({})",
                self.job_heartbeat_ms, self.stale_after_ms
            )));
        }
        if self.storage_backoff_max_ms < self.storage_backoff_base_ms {
            return Err(ConfigError::invalid(
                "storage_backoff_max_ms must not be below storage_backoff_base_ms",
            ));
        }
        self.retry.validate()
    }

    pub(crate) fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub(crate) fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub(crate) fn poll_jitter(&self) -> Duration {
        Duration::from_millis(self.poll_jitter_ms)
    }

    pub(crate) fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub(crate) fn job_heartbeat(&self) -> Duration {
        Duration::from_millis(self.job_heartbeat_ms)
    }

    pub(crate) fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub(crate) fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_interval_ms)
    }

    /// Pause after `failures` consecutive storage errors.
    pub(crate) fn storage_backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let delay = self
            .storage_backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.storage_backoff_max_ms);
        Duration::from_millis(delay)
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Parse {
            key: key.to_string(),
            value,
        }),
    }
}
