//! Retry with exponential backoff.
//!
//! Retrying is an explicit async wrapper around an operation (a broker
//! delivery, a poll cycle); nothing retries behind the caller's back.
//! Errors classify themselves through [`Retriable`]: transient failures are
//! re-run after a growing delay, permanent ones (a stalled poll, a rejected
//! local write) come back after the first attempt.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeouts, refused connections, 5xx answers, a full queue.
    Transient,

    /// Retrying the same operation cannot succeed.
    Permanent,
}

pub trait Retriable {
    fn kind(&self) -> ErrorKind;

    fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,

    pub initial_delay: Duration,

    /// Upper bound for any single delay.
    pub max_delay: Duration,

    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Redelivery of a failed message: 2s, 4s, 8s.
    pub const DEFAULT: Self = Self::new(3, Duration::from_secs(2), Duration::from_secs(16), 2.0);

    /// Riding out a remote outage: ten retries from 1s, capped at 30s.
    pub const RECOVERY: Self = Self::new(10, Duration::from_secs(1), Duration::from_secs(30), 2.0);

    /// Fail on the first error.
    pub const NONE: Self = Self::new(0, Duration::ZERO, Duration::ZERO, 1.0);

    pub const fn new(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        RetryConfig {
            max_retries,
            initial_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    /// Delay before retry number `retry`, counting from 1.
    pub fn delay_before(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
            .unwrap_or(self.max_delay)
    }

    /// The delays of every retry, in order.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            config: *self,
            retry: 0,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    retry: u32,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.retry >= self.config.max_retries {
            return None;
        }
        self.retry += 1;
        Some(self.config.delay_before(self.retry))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetryPolicy {
    #[default]
    RetryTransient,

    /// One attempt regardless of the config.
    NoRetry,
}

#[derive(Debug)]
pub enum RetryResult<T, E> {
    Success(T),

    /// Still failing transiently when the retries ran out.
    ExhaustedRetries {
        last_error: E,
        /// Including the first attempt.
        attempts: u32,
    },

    PermanentError(E),
}

impl<T, E> RetryResult<T, E> {
    pub fn into_result(self) -> Result<T, E> {
        match self {
            RetryResult::Success(v) => Ok(v),
            RetryResult::ExhaustedRetries { last_error, .. } => Err(last_error),
            RetryResult::PermanentError(e) => Err(e),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RetryResult::Success(_))
    }
}

/// Runs `operation` until it succeeds, fails permanently, or the backoff
/// of `config` is used up.
pub async fn retry_with_backoff<T, E, F, Fut>(
    config: RetryConfig,
    policy: RetryPolicy,
    mut operation: F,
) -> RetryResult<T, E>
where
    E: Retriable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delays = match policy {
        RetryPolicy::RetryTransient => config.backoff(),
        RetryPolicy::NoRetry => RetryConfig::NONE.backoff(),
    };
    let mut attempts = 0;

    loop {
        attempts += 1;
        let error = match operation().await {
            Ok(value) => return RetryResult::Success(value),
            Err(e) => e,
        };
        if error.kind() == ErrorKind::Permanent {
            return RetryResult::PermanentError(error);
        }
        let Some(delay) = delays.next() else {
            return RetryResult::ExhaustedRetries {
                last_error: error,
                attempts,
            };
        };
        debug!(attempts, delay_ms = delay.as_millis() as u64, "Transient failure, retrying");
        tokio::time::sleep(delay).await;
    }
}
