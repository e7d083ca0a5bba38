//! Store traits used by the tracker and the dispatcher.
//!
//! The traits are synchronous: every operation is a small in-memory update
//! plus (for durable stores) one atomic file write, and callers never hold
//! the result across an `.await`.

use std::collections::HashSet;
use std::io;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::error;

use crate::retry::{ErrorKind, Retriable};
use crate::tracker::Fingerprint;
use crate::types::{RequestId, ResourceId, SubscriptionResourceId, Watermark};

/// Errors raised by local persistence.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("schema version mismatch: expected {expected}, got {got}")]
    SchemaMismatch { expected: u32, got: u32 },
}

impl Retriable for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Io(_) => ErrorKind::Transient,
            StoreError::Json(_) | StoreError::SchemaMismatch { .. } => ErrorKind::Permanent,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Outcome of a deduplicated enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// A live entry already exists; nothing was changed.
    AlreadyQueued,
}

impl EnqueueOutcome {
    pub fn is_enqueued(self) -> bool {
        self == EnqueueOutcome::Enqueued
    }
}

/// A change selected for publishing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeMark {
    pub fingerprint: Fingerprint,
    pub resource_id: ResourceId,
}

/// What [`BatchStore::mark_changes`] did for one change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// The fingerprint was already recorded; nothing changed.
    AlreadyProcessed,

    /// Fingerprint recorded, but an earlier version of the resource is
    /// still queued and will pick this one up.
    StillQueued,

    /// Fingerprint recorded and resource marker set. Publish it.
    Marked,
}

/// A resource marker with the subscription resource it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedResource {
    pub subscription_resource: SubscriptionResourceId,
    pub resource_id: ResourceId,
    pub request_id: RequestId,
}

/// Append-only log of processed fingerprints per subscription resource.
pub trait ProcessedStore {
    /// Returns the subset of `fingerprints` that is already recorded.
    fn find_processed(
        &self,
        subscription_resource: &SubscriptionResourceId,
        fingerprints: &[Fingerprint],
    ) -> Result<HashSet<Fingerprint>>;

    /// Records a fingerprint. Returns `false` if it was already present.
    fn record_processed(
        &self,
        subscription_resource: &SubscriptionResourceId,
        fingerprint: &Fingerprint,
        processed_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Removes a fingerprint. Used to roll back a record whose publish failed.
    fn forget_processed(
        &self,
        subscription_resource: &SubscriptionResourceId,
        fingerprint: &Fingerprint,
    ) -> Result<bool>;

    /// Deletes fingerprints processed before `before`, returning how many.
    fn delete_processed_before(
        &self,
        subscription_resource: &SubscriptionResourceId,
        before: DateTime<Utc>,
    ) -> Result<usize>;
}

/// "Is queued" markers for subscription requests and individual resources.
pub trait QueueStore {
    fn enqueue_request(
        &self,
        subscription_resource: &SubscriptionResourceId,
        request_id: &RequestId,
        queued_at: DateTime<Utc>,
    ) -> Result<EnqueueOutcome>;

    /// Clears the request marker. Returns `false` if none was set.
    fn dequeue_request(&self, subscription_resource: &SubscriptionResourceId) -> Result<bool>;

    fn enqueue_resource(
        &self,
        subscription_resource: &SubscriptionResourceId,
        resource_id: &ResourceId,
        request_id: &RequestId,
        queued_at: DateTime<Utc>,
    ) -> Result<EnqueueOutcome>;

    fn dequeue_resource(
        &self,
        subscription_resource: &SubscriptionResourceId,
        resource_id: &ResourceId,
    ) -> Result<bool>;

    /// Clears every request marker set before `before`. Returns how many.
    fn clear_requests_queued_before(&self, before: DateTime<Utc>) -> Result<usize>;

    /// Resource markers set before `before`, ordered by subscription
    /// resource and resource id.
    fn resources_queued_before(&self, before: DateTime<Utc>) -> Result<Vec<QueuedResource>>;
}

/// Bookkeeping for a whole poll batch in one step.
///
/// The default methods go through the single-item operations and undo
/// their own partial work on error. Durable stores override them to write
/// once per batch.
pub trait BatchStore: ProcessedStore + QueueStore {
    /// Records the fingerprint of each change and sets its resource marker.
    ///
    /// Returns one outcome per change, in order. On error nothing of this
    /// call stays recorded.
    fn mark_changes(
        &self,
        subscription_resource: &SubscriptionResourceId,
        changes: &[ChangeMark],
        request_id: &RequestId,
        at: DateTime<Utc>,
    ) -> Result<Vec<MarkOutcome>> {
        let mut outcomes = Vec::with_capacity(changes.len());
        for change in changes {
            match mark_one(self, subscription_resource, change, request_id, at) {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    let (fingerprints, resources) = undo_set(changes, &outcomes);
                    if let Err(rollback) =
                        self.unmark_changes(subscription_resource, &fingerprints, &resources)
                    {
                        error!(error = %rollback, "Rolling back partially marked batch failed");
                    }
                    return Err(e);
                }
            }
        }
        Ok(outcomes)
    }

    /// Forgets `fingerprints` and clears the markers of `resources`.
    fn unmark_changes(
        &self,
        subscription_resource: &SubscriptionResourceId,
        fingerprints: &[Fingerprint],
        resources: &[ResourceId],
    ) -> Result<()> {
        for fingerprint in fingerprints {
            self.forget_processed(subscription_resource, fingerprint)?;
        }
        for resource_id in resources {
            self.dequeue_resource(subscription_resource, resource_id)?;
        }
        Ok(())
    }
}

fn mark_one<T: BatchStore + ?Sized>(
    store: &T,
    subscription_resource: &SubscriptionResourceId,
    change: &ChangeMark,
    request_id: &RequestId,
    at: DateTime<Utc>,
) -> Result<MarkOutcome> {
    if !store.record_processed(subscription_resource, &change.fingerprint, at)? {
        return Ok(MarkOutcome::AlreadyProcessed);
    }
    match store.enqueue_resource(subscription_resource, &change.resource_id, request_id, at) {
        Ok(EnqueueOutcome::Enqueued) => Ok(MarkOutcome::Marked),
        Ok(EnqueueOutcome::AlreadyQueued) => Ok(MarkOutcome::StillQueued),
        Err(e) => {
            if let Err(rollback) = store.forget_processed(subscription_resource, &change.fingerprint)
            {
                error!(fingerprint = %change.fingerprint, error = %rollback, "Rolling back processed fingerprint failed");
            }
            Err(e)
        }
    }
}

/// What has to be undone for `changes` that were marked with `outcomes`.
///
/// `outcomes` may be shorter than `changes`; changes without an outcome are
/// treated as never marked.
pub fn undo_set(
    changes: &[ChangeMark],
    outcomes: &[MarkOutcome],
) -> (Vec<Fingerprint>, Vec<ResourceId>) {
    let mut fingerprints = Vec::new();
    let mut resources = Vec::new();
    for (change, outcome) in changes.iter().zip(outcomes) {
        match outcome {
            MarkOutcome::AlreadyProcessed => {}
            MarkOutcome::StillQueued => fingerprints.push(change.fingerprint.clone()),
            MarkOutcome::Marked => {
                fingerprints.push(change.fingerprint.clone());
                resources.push(change.resource_id.clone());
            }
        }
    }
    (fingerprints, resources)
}

pub trait WatermarkStore {
    fn watermark(&self, subscription_resource: &SubscriptionResourceId)
    -> Result<Option<Watermark>>;

    /// Stores `max(current, to)` and returns the stored value.
    fn advance_watermark(
        &self,
        subscription_resource: &SubscriptionResourceId,
        to: Watermark,
    ) -> Result<Watermark>;
}

/// Everything the webhook processor needs from local persistence.
pub trait SyncStore: BatchStore + WatermarkStore + Send + Sync {}

impl<T> SyncStore for T where T: BatchStore + WatermarkStore + Send + Sync {}
