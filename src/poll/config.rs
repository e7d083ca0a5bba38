//! Polling configuration.
//!
//! # Polling Strategy
//!
//! - **Poll interval**: 10 minutes by default (`REMOTE_SYNC_POLL_INTERVAL_SECS`).
//!   Webhooks are the primary trigger; the interval is the fallback for
//!   missed notifications.
//! - **Jitter**: 0-20% added so that subscriptions do not poll in lockstep
//! - **Initial stagger**: derived from the subscription resource id hash
//! - **Tolerance**: 5 seconds subtracted from the watermark to absorb clock
//!   skew between this process and the remote server

use std::hash::{Hash, Hasher};
use std::time::Duration;

use crate::types::SubscriptionResourceId;

const DEFAULT_PAGE_SIZE: usize = 100;

const DEFAULT_TOLERANCE_MILLIS: u64 = 5_000;

/// Maximum number of changes handed to the consumer at once.
const DEFAULT_MAX_BATCH_SIZE: usize = 1_000;

const DEFAULT_POLL_INTERVAL_SECS: u64 = 600;

const DEFAULT_JITTER_PERCENT: u8 = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    /// Requested search page size (`_count`).
    pub page_size: usize,

    /// Default clock-skew tolerance, used when a subscription resource does
    /// not declare its own.
    pub tolerance: Duration,

    pub max_batch_size: usize,

    /// Interval between scheduled polls of one subscription resource.
    pub poll_interval: Duration,

    /// Jitter percentage added to the poll interval (0-100).
    pub jitter_percent: u8,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl PollConfig {
    pub fn new() -> Self {
        PollConfig {
            page_size: DEFAULT_PAGE_SIZE,
            tolerance: Duration::from_millis(DEFAULT_TOLERANCE_MILLIS),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            jitter_percent: DEFAULT_JITTER_PERCENT,
        }
    }

    /// Reads `REMOTE_SYNC_POLL_INTERVAL_SECS`, `REMOTE_SYNC_PAGE_SIZE` and
    /// `REMOTE_SYNC_TOLERANCE_MILLIS`. Unset or unparsable values keep their
    /// defaults.
    pub fn from_env() -> Self {
        let defaults = Self::new();
        PollConfig {
            poll_interval: env_parse("REMOTE_SYNC_POLL_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            page_size: env_parse("REMOTE_SYNC_PAGE_SIZE")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.page_size),
            tolerance: env_parse("REMOTE_SYNC_TOLERANCE_MILLIS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.tolerance),
            ..defaults
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Returns the poll interval with deterministic jitter for one
    /// subscription resource.
    ///
    /// `interval * (1 + (hash(id) % jitter_percent) / 100)`
    pub fn poll_interval_with_jitter(&self, id: &SubscriptionResourceId) -> Duration {
        if self.jitter_percent == 0 {
            return self.poll_interval;
        }
        let jitter = (id_hash(id) % self.jitter_percent as u64) as f64 / 100.0;
        self.poll_interval.mul_f64(1.0 + jitter)
    }

    /// Initial delay before the first scheduled poll: `hash(id) % (interval / 2)`.
    pub fn initial_poll_delay(&self, id: &SubscriptionResourceId) -> Duration {
        let max_delay = (self.poll_interval.as_secs() / 2).max(1);
        Duration::from_secs(id_hash(id) % max_delay)
    }
}

pub(crate) fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn id_hash(id: &SubscriptionResourceId) -> u64 {
    let mut hasher = std::hash::DefaultHasher::new();
    id.hash(&mut hasher);
    hasher.finish()
}
