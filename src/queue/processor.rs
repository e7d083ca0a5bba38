//! Webhook / scheduler entry point and the subscription-request consumer.
//!
//! # Flow
//!
//! ```text
//! received(sr, request_id)
//!   └─ enqueue_request marker ── already queued? ─► AlreadyQueued (debug)
//!   └─ publish SubscriptionRequest ── failed? ─► roll back marker, error
//!
//! receive(SubscriptionRequest)         (on the broker lane for `sr`)
//!   1. dequeue_request marker          (a change arriving now is fresh work)
//!   2. poll since the watermark
//!        per batch: unseen fingerprints ─► mark_changes (one store write) ─► publish each
//!   3. advance the watermark
//!   4. purge fingerprints older than the retention horizon
//! ```
//!
//! Steps 2-4 are strictly ordered. Purging before the watermark advances
//! could drop dedup evidence for changes the next cycle will still see.
//!
//! # Atomicity
//!
//! Every bookkeeping write that gates a publish is rolled back when the
//! publish fails: the request marker in `received`, and in step 2 the
//! fingerprints and resource markers of every change of the batch not yet
//! published, in one store write. A failed rollback is logged; the remaining
//! marker is cleared by the next processing run or consumer dequeue.
//!
//! # Restart
//!
//! With a broker that loses messages on restart, markers written by a
//! previous process point at messages that no longer exist. Before the first
//! notification or request is handled, stale request markers are cleared and
//! stale resource changes are published again.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, instrument, warn};

use super::broker::Broker;
use super::message::{QueueMessage, ResourceChange, SubscriptionRequest};
use crate::persistence::{ChangeMark, EnqueueOutcome, MarkOutcome, StoreError, SyncStore, undo_set};
use crate::poll::config::env_parse;
use crate::poll::{ChangeConsumer, ChangePoller, ChangeSource, CriteriaError, PollError};
use crate::retry::{ErrorKind, Retriable};
use crate::tracker::ProcessedVersionTracker;
use crate::types::{
    ChangeInfo, RequestId, ResourceId, SubscriptionRegistry, SubscriptionResourceId, Watermark,
};

/// Default retention of processed fingerprints (7 days).
const DEFAULT_MAX_PROCESSED_AGE_MINS: u64 = 7 * 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorConfig {
    /// How long processed fingerprints are kept.
    pub max_processed_age: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessorConfig {
    pub fn new() -> Self {
        ProcessorConfig {
            max_processed_age: Duration::from_secs(DEFAULT_MAX_PROCESSED_AGE_MINS * 60),
        }
    }

    /// Reads `REMOTE_SYNC_MAX_PROCESSED_AGE_MINS`.
    pub fn from_env() -> Self {
        ProcessorConfig {
            max_processed_age: env_parse("REMOTE_SYNC_MAX_PROCESSED_AGE_MINS")
                .map(|mins: u64| Duration::from_secs(mins * 60))
                .unwrap_or(Self::new().max_processed_age),
        }
    }

    pub fn with_max_processed_age(mut self, max_processed_age: Duration) -> Self {
        self.max_processed_age = max_processed_age;
        self
    }
}

/// Errors from the dispatcher. `B` is the broker error, `S` the change
/// source error.
#[derive(Debug, Error)]
pub enum DispatchError<B, S> {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("publish failed: {0}")]
    Broker(#[source] B),

    #[error("remote search failed: {0}")]
    Source(#[source] S),

    #[error(
        "subscription resource {subscription_resource} returned the same {count} resources again for lower bound {lower_bound}"
    )]
    Stall {
        subscription_resource: SubscriptionResourceId,
        lower_bound: DateTime<Utc>,
        count: usize,
    },

    #[error(transparent)]
    InvalidCriteria(CriteriaError),

    #[error("unknown subscription resource: {0}")]
    UnknownSubscription(SubscriptionResourceId),
}

impl<B, S> From<PollError<S, DispatchError<B, S>>> for DispatchError<B, S> {
    fn from(e: PollError<S, DispatchError<B, S>>) -> Self {
        match e {
            PollError::Source(e) => DispatchError::Source(e),
            PollError::Consumer(e) => e,
            PollError::Stall {
                subscription_resource,
                lower_bound,
                count,
            } => DispatchError::Stall {
                subscription_resource,
                lower_bound,
                count,
            },
            PollError::InvalidCriteria(e) => DispatchError::InvalidCriteria(e),
        }
    }
}

impl<B: Retriable, S: Retriable> Retriable for DispatchError<B, S> {
    fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Store(e) => e.kind(),
            DispatchError::Broker(e) => e.kind(),
            DispatchError::Source(e) => e.kind(),
            DispatchError::Stall { .. }
            | DispatchError::InvalidCriteria(_)
            | DispatchError::UnknownSubscription(_) => ErrorKind::Permanent,
        }
    }
}

pub type ProcessorError<B, S> = DispatchError<<B as Broker>::Error, <S as ChangeSource>::Error>;

/// Generates `<uuid>#<n>` request ids, with `n` in base 36.
#[derive(Debug)]
pub struct RequestIdGenerator {
    base: String,
    counter: AtomicU64,
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        RequestIdGenerator {
            base: uuid::Uuid::new_v4().to_string(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> RequestId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        RequestId::new(format!("{}#{}", self.base, to_base36(n)))
    }
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Summary of one processed subscription request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceiveSummary {
    /// Resource changes published for downstream processing.
    pub enqueued: usize,

    /// New versions of resources that were still queued.
    pub still_queued: usize,

    /// `None` when the subscription resource no longer exists.
    pub watermark: Option<Watermark>,
}

/// Converts change notifications into deduplicated broker messages.
pub struct WebHookProcessor<St, B, S> {
    registry: Arc<SubscriptionRegistry>,
    store: Arc<St>,
    broker: Arc<B>,
    poller: ChangePoller<S>,
    config: ProcessorConfig,
    request_ids: RequestIdGenerator,
    started_at: DateTime<Utc>,
    recovered: OnceCell<()>,
}

impl<St, B, S> WebHookProcessor<St, B, S>
where
    St: SyncStore,
    B: Broker,
    S: ChangeSource,
{
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        store: Arc<St>,
        broker: Arc<B>,
        poller: ChangePoller<S>,
        config: ProcessorConfig,
    ) -> Self {
        WebHookProcessor {
            registry,
            store,
            broker,
            poller,
            config,
            request_ids: RequestIdGenerator::new(),
            started_at: Utc::now(),
            recovered: OnceCell::new(),
        }
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn store(&self) -> &St {
        &self.store
    }

    pub fn poller(&self) -> &ChangePoller<S> {
        &self.poller
    }

    pub fn next_request_id(&self) -> RequestId {
        self.request_ids.next_id()
    }

    /// Runs [`Self::recover_markers`] once per processor; a failed attempt
    /// is repeated by the next caller.
    async fn ensure_recovered(&self) -> Result<(), ProcessorError<B, S>> {
        self.recovered
            .get_or_try_init(|| self.recover_markers())
            .await
            .map(|_| ())
    }

    /// Reconciles markers written before this processor started with a
    /// broker that does not keep messages across restarts.
    async fn recover_markers(&self) -> Result<(), ProcessorError<B, S>> {
        if self.broker.is_durable() {
            return Ok(());
        }
        let cleared = self.store.clear_requests_queued_before(self.started_at)?;
        // Their fingerprints are recorded and the watermark may be past
        // them, so a new poll would not bring them back.
        let stale = self.store.resources_queued_before(self.started_at)?;
        for queued in &stale {
            let message = QueueMessage::ResourceChange(ResourceChange {
                subscription_resource_id: queued.subscription_resource.clone(),
                resource_id: queued.resource_id.clone(),
                version: None,
                last_updated: None,
                request_id: queued.request_id.clone(),
            });
            self.broker
                .publish(message)
                .await
                .map_err(DispatchError::Broker)?;
        }
        if cleared > 0 || !stale.is_empty() {
            info!(
                cleared_requests = cleared,
                republished = stale.len(),
                "Recovered queued markers left by a previous run"
            );
        }
        Ok(())
    }

    /// Accepts a change notification for a subscription resource.
    ///
    /// Returns [`EnqueueOutcome::AlreadyQueued`] when a request for the same
    /// subscription resource is waiting on the broker; the pending request
    /// will see this notification's changes too.
    #[instrument(skip_all, fields(subscription_resource = %subscription_resource, %request_id))]
    pub async fn received(
        &self,
        subscription_resource: &SubscriptionResourceId,
        request_id: RequestId,
    ) -> Result<EnqueueOutcome, ProcessorError<B, S>> {
        if self.registry.get(subscription_resource).is_none() {
            return Err(DispatchError::UnknownSubscription(
                subscription_resource.clone(),
            ));
        }
        self.ensure_recovered().await?;

        let received_at = Utc::now();
        let outcome = self
            .store
            .enqueue_request(subscription_resource, &request_id, received_at)?;
        if outcome == EnqueueOutcome::AlreadyQueued {
            debug!("Subscription resource is already queued");
            return Ok(outcome);
        }

        let message = QueueMessage::SubscriptionRequest(SubscriptionRequest {
            subscription_resource_id: subscription_resource.clone(),
            request_id,
            received_at,
        });
        if let Err(e) = self.broker.publish(message).await {
            warn!(error = %e, "Publishing subscription request failed, rolling back");
            if let Err(rollback) = self.store.dequeue_request(subscription_resource) {
                error!(error = %rollback, "Rolling back queued marker failed");
            }
            return Err(DispatchError::Broker(e));
        }

        info!("Subscription request enqueued");
        Ok(EnqueueOutcome::Enqueued)
    }

    /// Processes a subscription request taken from the broker.
    #[instrument(
        skip(self, request),
        fields(subscription_resource = %request.subscription_resource_id, request_id = %request.request_id)
    )]
    pub async fn receive(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<ReceiveSummary, ProcessorError<B, S>> {
        let id = &request.subscription_resource_id;
        self.ensure_recovered().await?;
        self.store.dequeue_request(id)?;

        let Some(subscription) = self.registry.get(id) else {
            warn!("Subscription resource no longer exists, skipping request");
            return Ok(ReceiveSummary::default());
        };

        let watermark = self.store.watermark(id)?.unwrap_or(Watermark::MIN);
        let mut consumer = EnqueueConsumer {
            store: &*self.store,
            broker: &*self.broker,
            subscription_resource: id,
            request_id: self.request_ids.next_id(),
            enqueued: 0,
            still_queued: 0,
            _source: std::marker::PhantomData::<fn() -> S>,
        };
        let outcome = self
            .poller
            .poll(&subscription, watermark, &mut consumer)
            .await?;

        let advanced = self.store.advance_watermark(id, outcome.new_watermark)?;

        // Entries processed before the next cycle's lower bound can only
        // belong to changes that the next cycle will not return again.
        let tolerance = subscription.tolerance.unwrap_or(self.poller.config().tolerance);
        let tolerance = chrono::Duration::from_std(tolerance).unwrap_or(chrono::Duration::MAX);
        let max_age = chrono::Duration::from_std(self.config.max_processed_age)
            .unwrap_or(chrono::Duration::MAX);
        let age_horizon = Utc::now()
            .checked_sub_signed(max_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let horizon = age_horizon.min(advanced.lower_bound(tolerance));
        ProcessedVersionTracker::new(&*self.store).purge(id, horizon)?;

        info!(
            enqueued = consumer.enqueued,
            still_queued = consumer.still_queued,
            watermark = %advanced,
            "Subscription request processed"
        );
        Ok(ReceiveSummary {
            enqueued: consumer.enqueued,
            still_queued: consumer.still_queued,
            watermark: Some(advanced),
        })
    }

    /// Clears the queued marker of a resource change taken by the
    /// downstream consumer. Call this before processing the change so that
    /// a newer version arriving meanwhile is enqueued again.
    pub fn resource_dequeued(
        &self,
        subscription_resource: &SubscriptionResourceId,
        resource_id: &ResourceId,
    ) -> Result<bool, StoreError> {
        let removed = self
            .store
            .dequeue_resource(subscription_resource, resource_id)?;
        if !removed {
            debug!(
                subscription_resource = %subscription_resource,
                resource_id = %resource_id,
                "Resource was not marked as queued"
            );
        }
        Ok(removed)
    }
}

/// Entry point for change notifications, independent of how the dispatcher
/// is assembled. Used by the webhook endpoint and the poll scheduler.
pub trait NotificationReceiver: Send + Sync + 'static {
    type Error: std::error::Error + Retriable + Send + Sync + 'static;

    fn registry(&self) -> &SubscriptionRegistry;

    fn next_request_id(&self) -> RequestId;

    fn received(
        &self,
        subscription_resource: &SubscriptionResourceId,
        request_id: RequestId,
    ) -> impl Future<Output = Result<EnqueueOutcome, Self::Error>> + Send;
}

impl<St, B, S> NotificationReceiver for WebHookProcessor<St, B, S>
where
    St: SyncStore + 'static,
    B: Broker + 'static,
    S: ChangeSource + 'static,
{
    type Error = ProcessorError<B, S>;

    fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    fn next_request_id(&self) -> RequestId {
        self.request_ids.next_id()
    }

    async fn received(
        &self,
        subscription_resource: &SubscriptionResourceId,
        request_id: RequestId,
    ) -> Result<EnqueueOutcome, Self::Error> {
        WebHookProcessor::received(self, subscription_resource, request_id).await
    }
}

/// Poll consumer that records and publishes unseen changes.
struct EnqueueConsumer<'a, St, B, S> {
    store: &'a St,
    broker: &'a B,
    subscription_resource: &'a SubscriptionResourceId,
    request_id: RequestId,
    enqueued: usize,
    still_queued: usize,
    _source: std::marker::PhantomData<fn() -> S>,
}

impl<St, B, S> EnqueueConsumer<'_, St, B, S>
where
    St: SyncStore,
    B: Broker,
    S: ChangeSource,
{
    async fn enqueue_batch(&mut self, batch: Vec<ChangeInfo>) -> Result<(), ProcessorError<B, S>> {
        let processed_at = Utc::now();
        let sr = self.subscription_resource;
        let unseen = ProcessedVersionTracker::new(self.store).unseen(sr, &batch, processed_at)?;
        if unseen.is_empty() {
            return Ok(());
        }

        let marks: Vec<ChangeMark> = unseen
            .iter()
            .map(|u| ChangeMark {
                fingerprint: u.fingerprint.clone(),
                resource_id: u.change.id.clone(),
            })
            .collect();
        let outcomes = self
            .store
            .mark_changes(sr, &marks, &self.request_id, processed_at)?;

        for (position, (unseen, outcome)) in unseen.into_iter().zip(&outcomes).enumerate() {
            let resource_id = unseen.change.id.clone();
            match outcome {
                MarkOutcome::AlreadyProcessed => {
                    debug!(resource_id = %resource_id, "Resource version recorded concurrently");
                    continue;
                }
                MarkOutcome::StillQueued => {
                    debug!(resource_id = %resource_id, "Resource is still queued");
                    self.still_queued += 1;
                    continue;
                }
                MarkOutcome::Marked => {}
            }

            let message = QueueMessage::ResourceChange(ResourceChange::new(
                sr.clone(),
                unseen.change,
                self.request_id.clone(),
            ));
            if let Err(e) = self.broker.publish(message).await {
                warn!(resource_id = %resource_id, error = %e, "Publishing resource change failed, rolling back");
                let (fingerprints, resources) = undo_set(&marks[position..], &outcomes[position..]);
                if let Err(rollback) = self.store.unmark_changes(sr, &fingerprints, &resources) {
                    error!(error = %rollback, "Rolling back unpublished resource changes failed");
                }
                return Err(DispatchError::Broker(e));
            }
            self.enqueued += 1;
        }
        Ok(())
    }
}

impl<St, B, S> ChangeConsumer for EnqueueConsumer<'_, St, B, S>
where
    St: SyncStore,
    B: Broker,
    S: ChangeSource,
{
    type Error = ProcessorError<B, S>;

    async fn accept(&mut self, batch: Vec<ChangeInfo>) -> Result<(), Self::Error> {
        self.enqueue_batch(batch).await
    }
}

#[cfg(test)]
#[path = "processor_tests.rs"]
mod tests;
