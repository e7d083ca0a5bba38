//! Aggregated configuration.
//!
//! Each subsystem owns its config struct; this module only bundles them so
//! an embedding binary can read everything from the environment at once.
//!
//! | Variable | Default |
//! |---|---|
//! | `REMOTE_SYNC_POLL_INTERVAL_SECS` | 600 |
//! | `REMOTE_SYNC_PAGE_SIZE` | 100 |
//! | `REMOTE_SYNC_TOLERANCE_MILLIS` | 5000 |
//! | `REMOTE_SYNC_MAX_PROCESSED_AGE_MINS` | 10080 (7 days) |
//! | `REMOTE_SYNC_CONCURRENCY` | 4 |

use crate::poll::PollConfig;
use crate::queue::{BrokerConfig, ProcessorConfig};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncConfig {
    pub poll: PollConfig,
    pub processor: ProcessorConfig,
    pub broker: BrokerConfig,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        SyncConfig {
            poll: PollConfig::from_env(),
            processor: ProcessorConfig::from_env(),
            broker: BrokerConfig::from_env(),
        }
    }

    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_processor(mut self, processor: ProcessorConfig) -> Self {
        self.processor = processor;
        self
    }

    pub fn with_broker(mut self, broker: BrokerConfig) -> Self {
        self.broker = broker;
        self
    }
}
