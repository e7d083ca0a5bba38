//! Processed-version tracking.
//!
//! Answers "have I already enqueued this exact state of this resource?" for
//! one subscription resource. Entries are append-only and pruned by age once
//! the subscription's watermark has moved past the retention horizon.

pub mod fingerprint;

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::persistence::{ProcessedStore, Result};
use crate::types::{ChangeInfo, SubscriptionResourceId};

pub use fingerprint::Fingerprint;

/// A change that has not been processed yet, with its fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnseenChange {
    pub change: ChangeInfo,
    pub fingerprint: Fingerprint,
}

/// Borrowed view over a [`ProcessedStore`].
#[derive(Debug)]
pub struct ProcessedVersionTracker<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S: ProcessedStore + ?Sized> ProcessedVersionTracker<'a, S> {
    pub fn new(store: &'a S) -> Self {
        ProcessedVersionTracker { store }
    }

    /// Filters `changes` down to those whose fingerprint is not recorded yet.
    ///
    /// All fingerprints are checked with a single store lookup. Duplicates
    /// within `changes` are reported once, in first-seen order.
    pub fn unseen(
        &self,
        subscription_resource: &SubscriptionResourceId,
        changes: &[ChangeInfo],
        processed_at: DateTime<Utc>,
    ) -> Result<Vec<UnseenChange>> {
        let fingerprints: Vec<Fingerprint> = changes
            .iter()
            .map(|change| Fingerprint::of(change, processed_at))
            .collect();
        let processed = self
            .store
            .find_processed(subscription_resource, &fingerprints)?;

        let mut emitted = HashSet::new();
        let mut unseen = Vec::new();
        for (change, fingerprint) in changes.iter().zip(fingerprints) {
            if processed.contains(&fingerprint) {
                debug!(
                    subscription_resource = %subscription_resource,
                    resource_id = %change.id,
                    "Resource version already processed"
                );
                continue;
            }
            if emitted.insert(fingerprint.clone()) {
                unseen.push(UnseenChange {
                    change: change.clone(),
                    fingerprint,
                });
            }
        }
        Ok(unseen)
    }

    /// Records a fingerprint. Returns `false` if another run recorded it first.
    pub fn record(
        &self,
        subscription_resource: &SubscriptionResourceId,
        fingerprint: &Fingerprint,
        processed_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.store
            .record_processed(subscription_resource, fingerprint, processed_at)
    }

    pub fn forget(
        &self,
        subscription_resource: &SubscriptionResourceId,
        fingerprint: &Fingerprint,
    ) -> Result<bool> {
        self.store.forget_processed(subscription_resource, fingerprint)
    }

    /// Deletes entries processed before `horizon`. Only call this after the
    /// subscription's watermark has been advanced for the current cycle.
    pub fn purge(
        &self,
        subscription_resource: &SubscriptionResourceId,
        horizon: DateTime<Utc>,
    ) -> Result<usize> {
        let pruned = self
            .store
            .delete_processed_before(subscription_resource, horizon)?;
        if pruned > 0 {
            debug!(
                subscription_resource = %subscription_resource,
                pruned,
                %horizon,
                "Purged processed fingerprints"
            );
        }
        Ok(pruned)
    }
}
