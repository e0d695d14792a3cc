use backon::{ExponentialBuilder, Retryable as _};
use log::warn;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Why a retried operation gave up.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: u32, last: E },
    /// An attempt failed with an error that retrying cannot fix.
    Terminal(E),
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            min_delay,
            max_delay,
        }
    }

    /// A single attempt, no waiting.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
    }

    /// Runs `operation` until it succeeds, fails terminally, or the attempt budget is spent.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut attempts = 0u32;
        let result = (|| {
            attempts += 1;
            operation()
        })
        .retry(self.backoff())
        .sleep(tokio::time::sleep)
        .when(|err: &E| err.is_retryable())
        .notify(|err: &E, delay: Duration| {
            warn!("{} failed: {}, retrying in {:?}", label, err, delay);
        })
        .await;

        result.map_err(|err| {
            if err.is_retryable() {
                RetryError::Exhausted {
                    attempts,
                    last: err,
                }
            } else {
                RetryError::Terminal(err)
            }
        })
    }
}
