use crate::error::ScanError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_WORKERS: usize = 8;
pub const DEFAULT_BATCH_SIZE: usize = 25;
pub const DEFAULT_PREFETCH_DEPTH: usize = 5;
pub const DEFAULT_CACHE_CAPACITY: usize = 20;
pub const DEFAULT_REQUESTS_PER_SECOND: usize = 50;
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_FETCH_ATTEMPTS: u32 = 3;
pub const DEFAULT_SINK_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_MIN_DELAY_MS: u64 = 200;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 5_000;
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;
pub const DEFAULT_HEAD_POLL_INTERVAL_MS: u64 = 2_000;
pub const PROGRESS_LOG_INTERVAL: u64 = 100;

/// Tunables for one scanning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Upper bound on batches classified at the same time.
    pub workers: usize,
    /// Transactions per batch.
    pub batch_size: usize,
    /// Blocks fetched ahead of the one being consumed.
    pub prefetch_depth: usize,
    pub cache_capacity: usize,
    pub requests_per_second: usize,
    pub call_timeout_ms: u64,
    pub fetch_attempts: u32,
    pub sink_attempts: u32,
    pub retry_min_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Failed blocks in a row after which the run is aborted.
    pub max_consecutive_failures: u32,
    pub head_poll_interval_ms: u64,
    pub progress_log_interval: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            batch_size: DEFAULT_BATCH_SIZE,
            prefetch_depth: DEFAULT_PREFETCH_DEPTH,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            requests_per_second: DEFAULT_REQUESTS_PER_SECOND,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            fetch_attempts: DEFAULT_FETCH_ATTEMPTS,
            sink_attempts: DEFAULT_SINK_ATTEMPTS,
            retry_min_delay_ms: DEFAULT_RETRY_MIN_DELAY_MS,
            retry_max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            head_poll_interval_ms: DEFAULT_HEAD_POLL_INTERVAL_MS,
            progress_log_interval: PROGRESS_LOG_INTERVAL,
        }
    }
}

impl ScannerConfig {
    /// Defaults overlaid with any `SCANNER_*` environment variables that are set.
    pub fn from_env() -> Result<Self, ScanError> {
        let mut config = Self::default();
        overlay(&mut config.workers, "SCANNER_WORKERS")?;
        overlay(&mut config.batch_size, "SCANNER_BATCH_SIZE")?;
        overlay(&mut config.prefetch_depth, "SCANNER_PREFETCH_DEPTH")?;
        overlay(&mut config.cache_capacity, "SCANNER_CACHE_CAPACITY")?;
        overlay(&mut config.requests_per_second, "SCANNER_REQUESTS_PER_SECOND")?;
        overlay(&mut config.call_timeout_ms, "SCANNER_CALL_TIMEOUT_MS")?;
        overlay(&mut config.fetch_attempts, "SCANNER_FETCH_ATTEMPTS")?;
        overlay(&mut config.sink_attempts, "SCANNER_SINK_ATTEMPTS")?;
        overlay(&mut config.retry_min_delay_ms, "SCANNER_RETRY_MIN_DELAY_MS")?;
        overlay(&mut config.retry_max_delay_ms, "SCANNER_RETRY_MAX_DELAY_MS")?;
        overlay(&mut config.max_consecutive_failures, "SCANNER_MAX_CONSECUTIVE_FAILURES")?;
        overlay(&mut config.head_poll_interval_ms, "SCANNER_HEAD_POLL_INTERVAL_MS")?;
        overlay(&mut config.progress_log_interval, "SCANNER_PROGRESS_LOG_INTERVAL")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ScanError> {
        let non_zero = [
            ("workers", self.workers),
            ("batch_size", self.batch_size),
            ("cache_capacity", self.cache_capacity),
            ("requests_per_second", self.requests_per_second),
            ("fetch_attempts", self.fetch_attempts as usize),
            ("sink_attempts", self.sink_attempts as usize),
            ("max_consecutive_failures", self.max_consecutive_failures as usize),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(ScanError::InvalidConfig(format!("{name} must be greater than 0")));
            }
        }
        if self.cache_capacity < self.prefetch_depth {
            return Err(ScanError::InvalidConfig(format!(
                "cache_capacity ({}) must be at least prefetch_depth ({})",
                self.cache_capacity, self.prefetch_depth
            )));
        }
        if self.retry_min_delay_ms > self.retry_max_delay_ms {
            return Err(ScanError::InvalidConfig(
                "retry_min_delay_ms must not exceed retry_max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn head_poll_interval(&self) -> Duration {
        Duration::from_millis(self.head_poll_interval_ms)
    }

    pub fn fetch_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.fetch_attempts,
            Duration::from_millis(self.retry_min_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }

    pub fn sink_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.sink_attempts,
            Duration::from_millis(self.retry_min_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }
}

fn overlay<T: FromStr>(field: &mut T, key: &str) -> Result<(), ScanError> {
    if let Ok(raw) = std::env::var(key) {
        *field = raw
            .trim()
            .parse()
            .map_err(|_| ScanError::InvalidConfig(format!("{key}: cannot parse {raw:?}")))?;
    }
    Ok(())
}
