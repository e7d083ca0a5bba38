//! In-process store.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use super::state::SyncState;
use super::store::{
    BatchStore, ChangeMark, EnqueueOutcome, MarkOutcome, ProcessedStore, QueueStore,
    QueuedResource, Result, WatermarkStore,
};
use crate::tracker::Fingerprint;
use crate::types::{RequestId, ResourceId, SubscriptionResourceId, Watermark};

/// A [`super::SyncStore`] that keeps everything in memory. State is lost on
/// restart, which only costs a re-poll of the tolerance window.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<SyncState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: SyncState) -> Self {
        MemoryStore {
            state: Mutex::new(state),
        }
    }

    /// Returns a copy of the current state.
    pub fn snapshot(&self) -> SyncState {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ProcessedStore for MemoryStore {
    fn find_processed(
        &self,
        subscription_resource: &SubscriptionResourceId,
        fingerprints: &[Fingerprint],
    ) -> Result<HashSet<Fingerprint>> {
        Ok(self.lock().find_processed(subscription_resource, fingerprints))
    }

    fn record_processed(
        &self,
        subscription_resource: &SubscriptionResourceId,
        fingerprint: &Fingerprint,
        processed_at: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self
            .lock()
            .record_processed(subscription_resource, fingerprint, processed_at))
    }

    fn forget_processed(
        &self,
        subscription_resource: &SubscriptionResourceId,
        fingerprint: &Fingerprint,
    ) -> Result<bool> {
        Ok(self.lock().forget_processed(subscription_resource, fingerprint))
    }

    fn delete_processed_before(
        &self,
        subscription_resource: &SubscriptionResourceId,
        before: DateTime<Utc>,
    ) -> Result<usize> {
        Ok(self
            .lock()
            .delete_processed_before(subscription_resource, before))
    }
}

impl QueueStore for MemoryStore {
    fn enqueue_request(
        &self,
        subscription_resource: &SubscriptionResourceId,
        request_id: &RequestId,
        queued_at: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        Ok(self
            .lock()
            .enqueue_request(subscription_resource, request_id, queued_at))
    }

    fn dequeue_request(&self, subscription_resource: &SubscriptionResourceId) -> Result<bool> {
        Ok(self.lock().dequeue_request(subscription_resource))
    }

    fn enqueue_resource(
        &self,
        subscription_resource: &SubscriptionResourceId,
        resource_id: &ResourceId,
        request_id: &RequestId,
        queued_at: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        Ok(self.lock().enqueue_resource(
            subscription_resource,
            resource_id,
            request_id,
            queued_at,
        ))
    }

    fn dequeue_resource(
        &self,
        subscription_resource: &SubscriptionResourceId,
        resource_id: &ResourceId,
    ) -> Result<bool> {
        Ok(self
            .lock()
            .dequeue_resource(subscription_resource, resource_id))
    }

    fn clear_requests_queued_before(&self, before: DateTime<Utc>) -> Result<usize> {
        Ok(self.lock().clear_requests_queued_before(before))
    }

    fn resources_queued_before(&self, before: DateTime<Utc>) -> Result<Vec<QueuedResource>> {
        Ok(self.lock().resources_queued_before(before))
    }
}

impl BatchStore for MemoryStore {
    fn mark_changes(
        &self,
        subscription_resource: &SubscriptionResourceId,
        changes: &[ChangeMark],
        request_id: &RequestId,
        at: DateTime<Utc>,
    ) -> Result<Vec<MarkOutcome>> {
        Ok(self
            .lock()
            .mark_changes(subscription_resource, changes, request_id, at))
    }

    fn unmark_changes(
        &self,
        subscription_resource: &SubscriptionResourceId,
        fingerprints: &[Fingerprint],
        resources: &[ResourceId],
    ) -> Result<()> {
        self.lock()
            .unmark_changes(subscription_resource, fingerprints, resources);
        Ok(())
    }
}

impl WatermarkStore for MemoryStore {
    fn watermark(
        &self,
        subscription_resource: &SubscriptionResourceId,
    ) -> Result<Option<Watermark>> {
        Ok(self.lock().watermark(subscription_resource))
    }

    fn advance_watermark(
        &self,
        subscription_resource: &SubscriptionResourceId,
        to: Watermark,
    ) -> Result<Watermark> {
        Ok(self.lock().advance_watermark(subscription_resource, to))
    }
}
