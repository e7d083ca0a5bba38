//! The synchronization bookkeeping held by every store.
//!
//! `SyncState` is a plain serializable value. Both [`super::MemoryStore`] and
//! [`super::FileStore`] keep one behind a mutex and delegate every store
//! operation to the methods here, so the two implementations cannot drift
//! apart semantically.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::store::{ChangeMark, EnqueueOutcome, MarkOutcome, QueuedResource};
use crate::tracker::Fingerprint;
use crate::types::{RequestId, ResourceId, SubscriptionResourceId, Watermark};

/// A live "is queued" marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedEntry {
    pub request_id: RequestId,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// Last completed poll cycle per subscription resource.
    #[serde(default)]
    pub watermarks: HashMap<SubscriptionResourceId, Watermark>,

    /// Processed fingerprints with the time they were processed.
    #[serde(default)]
    pub processed: HashMap<SubscriptionResourceId, HashMap<Fingerprint, DateTime<Utc>>>,

    /// At most one live request per subscription resource.
    #[serde(default)]
    pub queued_requests: HashMap<SubscriptionResourceId, QueuedEntry>,

    /// Remote resources enqueued for downstream processing and not yet taken.
    #[serde(default)]
    pub queued_resources: HashMap<SubscriptionResourceId, HashMap<ResourceId, QueuedEntry>>,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_processed(
        &self,
        subscription_resource: &SubscriptionResourceId,
        fingerprints: &[Fingerprint],
    ) -> HashSet<Fingerprint> {
        let Some(seen) = self.processed.get(subscription_resource) else {
            return HashSet::new();
        };
        fingerprints
            .iter()
            .filter(|fp| seen.contains_key(*fp))
            .cloned()
            .collect()
    }

    /// Returns `false` when the fingerprint was already recorded. The original
    /// processing time is kept in that case.
    pub fn record_processed(
        &mut self,
        subscription_resource: &SubscriptionResourceId,
        fingerprint: &Fingerprint,
        processed_at: DateTime<Utc>,
    ) -> bool {
        let seen = self
            .processed
            .entry(subscription_resource.clone())
            .or_default();
        if seen.contains_key(fingerprint) {
            return false;
        }
        seen.insert(fingerprint.clone(), processed_at);
        true
    }

    pub fn forget_processed(
        &mut self,
        subscription_resource: &SubscriptionResourceId,
        fingerprint: &Fingerprint,
    ) -> bool {
        let Some(seen) = self.processed.get_mut(subscription_resource) else {
            return false;
        };
        let removed = seen.remove(fingerprint).is_some();
        if seen.is_empty() {
            self.processed.remove(subscription_resource);
        }
        removed
    }

    /// Removes fingerprints processed strictly before `before`. Returns the
    /// number removed.
    pub fn delete_processed_before(
        &mut self,
        subscription_resource: &SubscriptionResourceId,
        before: DateTime<Utc>,
    ) -> usize {
        let Some(seen) = self.processed.get_mut(subscription_resource) else {
            return 0;
        };
        let before_len = seen.len();
        seen.retain(|_, processed_at| *processed_at >= before);
        let pruned = before_len - seen.len();
        if seen.is_empty() {
            self.processed.remove(subscription_resource);
        }
        pruned
    }

    pub fn enqueue_request(
        &mut self,
        subscription_resource: &SubscriptionResourceId,
        request_id: &RequestId,
        queued_at: DateTime<Utc>,
    ) -> EnqueueOutcome {
        if self.queued_requests.contains_key(subscription_resource) {
            return EnqueueOutcome::AlreadyQueued;
        }
        self.queued_requests.insert(
            subscription_resource.clone(),
            QueuedEntry {
                request_id: request_id.clone(),
                queued_at,
            },
        );
        EnqueueOutcome::Enqueued
    }

    pub fn dequeue_request(&mut self, subscription_resource: &SubscriptionResourceId) -> bool {
        self.queued_requests.remove(subscription_resource).is_some()
    }

    pub fn enqueue_resource(
        &mut self,
        subscription_resource: &SubscriptionResourceId,
        resource_id: &ResourceId,
        request_id: &RequestId,
        queued_at: DateTime<Utc>,
    ) -> EnqueueOutcome {
        let queued = self
            .queued_resources
            .entry(subscription_resource.clone())
            .or_default();
        if queued.contains_key(resource_id) {
            return EnqueueOutcome::AlreadyQueued;
        }
        queued.insert(
            resource_id.clone(),
            QueuedEntry {
                request_id: request_id.clone(),
                queued_at,
            },
        );
        EnqueueOutcome::Enqueued
    }

    pub fn dequeue_resource(
        &mut self,
        subscription_resource: &SubscriptionResourceId,
        resource_id: &ResourceId,
    ) -> bool {
        let Some(queued) = self.queued_resources.get_mut(subscription_resource) else {
            return false;
        };
        let removed = queued.remove(resource_id).is_some();
        if queued.is_empty() {
            self.queued_resources.remove(subscription_resource);
        }
        removed
    }

    pub fn mark_changes(
        &mut self,
        subscription_resource: &SubscriptionResourceId,
        changes: &[ChangeMark],
        request_id: &RequestId,
        at: DateTime<Utc>,
    ) -> Vec<MarkOutcome> {
        changes
            .iter()
            .map(|change| {
                if !self.record_processed(subscription_resource, &change.fingerprint, at) {
                    return MarkOutcome::AlreadyProcessed;
                }
                match self.enqueue_resource(subscription_resource, &change.resource_id, request_id, at)
                {
                    EnqueueOutcome::Enqueued => MarkOutcome::Marked,
                    EnqueueOutcome::AlreadyQueued => MarkOutcome::StillQueued,
                }
            })
            .collect()
    }

    pub fn unmark_changes(
        &mut self,
        subscription_resource: &SubscriptionResourceId,
        fingerprints: &[Fingerprint],
        resources: &[ResourceId],
    ) {
        for fingerprint in fingerprints {
            self.forget_processed(subscription_resource, fingerprint);
        }
        for resource_id in resources {
            self.dequeue_resource(subscription_resource, resource_id);
        }
    }

    /// Removes request markers queued strictly before `before`.
    pub fn clear_requests_queued_before(&mut self, before: DateTime<Utc>) -> usize {
        let before_len = self.queued_requests.len();
        self.queued_requests
            .retain(|_, entry| entry.queued_at >= before);
        before_len - self.queued_requests.len()
    }

    pub fn resources_queued_before(&self, before: DateTime<Utc>) -> Vec<QueuedResource> {
        let mut stale: Vec<QueuedResource> = self
            .queued_resources
            .iter()
            .flat_map(|(subscription_resource, queued)| {
                queued
                    .iter()
                    .filter(|(_, entry)| entry.queued_at < before)
                    .map(|(resource_id, entry)| QueuedResource {
                        subscription_resource: subscription_resource.clone(),
                        resource_id: resource_id.clone(),
                        request_id: entry.request_id.clone(),
                    })
            })
            .collect();
        stale.sort_by(|a, b| {
            (&a.subscription_resource, &a.resource_id).cmp(&(&b.subscription_resource, &b.resource_id))
        });
        stale
    }

    pub fn watermark(&self, subscription_resource: &SubscriptionResourceId) -> Option<Watermark> {
        self.watermarks.get(subscription_resource).copied()
    }

    /// Stores `max(current, to)` and returns it.
    pub fn advance_watermark(
        &mut self,
        subscription_resource: &SubscriptionResourceId,
        to: Watermark,
    ) -> Watermark {
        let entry = self
            .watermarks
            .entry(subscription_resource.clone())
            .or_insert(to);
        *entry = entry.advance(to);
        *entry
    }
}
