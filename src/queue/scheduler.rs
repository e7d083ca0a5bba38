//! Periodic trigger for subscription resources.
//!
//! Webhooks are the primary trigger, but a missed delivery would leave
//! changes unprocessed until the next one. The scheduler calls `received`
//! for every registered subscription resource on a jittered interval, with
//! an initial stagger derived from the id so that restarts do not poll
//! everything at once. A notification that finds a request still queued is
//! coalesced by the dispatcher, so overlapping triggers are cheap.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::processor::NotificationReceiver;
use crate::persistence::EnqueueOutcome;
use crate::poll::PollConfig;
use crate::types::SubscriptionResourceId;

pub struct PollScheduler<R> {
    receiver: Arc<R>,
    config: PollConfig,
    shutdown: CancellationToken,
}

impl<R: NotificationReceiver> PollScheduler<R> {
    pub fn new(receiver: Arc<R>, config: PollConfig, shutdown: CancellationToken) -> Self {
        PollScheduler {
            receiver,
            config,
            shutdown,
        }
    }

    /// Runs until the shutdown token is cancelled.
    ///
    /// Subscription resources are read from the registry once at start; a
    /// resource removed later stops its own loop.
    pub async fn run(self) {
        let ids = self.receiver.registry().ids();
        info!(subscription_resources = ids.len(), "Starting poll scheduler");

        let mut tasks = JoinSet::new();
        for id in ids {
            tasks.spawn(trigger_loop(
                self.receiver.clone(),
                self.config.clone(),
                self.shutdown.clone(),
                id,
            ));
        }
        while tasks.join_next().await.is_some() {}

        info!("Poll scheduler stopped");
    }
}

async fn trigger_loop<R: NotificationReceiver>(
    receiver: Arc<R>,
    config: PollConfig,
    shutdown: CancellationToken,
    id: SubscriptionResourceId,
) {
    if !sleep_or_cancel(config.initial_poll_delay(&id), &shutdown).await {
        return;
    }

    loop {
        if receiver.registry().get(&id).is_none() {
            info!(subscription_resource = %id, "Subscription resource removed, stopping trigger");
            return;
        }

        let request_id = receiver.next_request_id();
        match receiver.received(&id, request_id).await {
            Ok(EnqueueOutcome::Enqueued) => {
                debug!(subscription_resource = %id, "Scheduled poll enqueued");
            }
            Ok(EnqueueOutcome::AlreadyQueued) => {}
            Err(e) => {
                warn!(subscription_resource = %id, error = %e, "Scheduled poll failed to enqueue");
            }
        }

        if !sleep_or_cancel(config.poll_interval_with_jitter(&id), &shutdown).await {
            return;
        }
    }
}

/// Returns false when cancelled first.
async fn sleep_or_cancel(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
