//! Durable store backed by a single JSON snapshot file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::snapshot::{SyncSnapshot, save_snapshot_atomic, try_load_snapshot};
use super::state::SyncState;
use super::store::{
    BatchStore, ChangeMark, EnqueueOutcome, MarkOutcome, ProcessedStore, QueueStore,
    QueuedResource, Result, WatermarkStore,
};
use crate::tracker::Fingerprint;
use crate::types::{RequestId, ResourceId, SubscriptionResourceId, Watermark};

/// File name of the snapshot inside the state directory.
pub const STATE_FILE_NAME: &str = "sync_state.json";

/// A [`super::SyncStore`] that persists every mutation before reporting it.
///
/// Mutations are applied to a copy of the state, the copy is written
/// atomically, and only then swapped in. A failed write therefore leaves both
/// the file and the in-memory state unchanged, and the caller sees the error.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    state: Mutex<SyncState>,
}

impl FileStore {
    /// Opens (or initializes) the store in `state_dir`.
    pub fn open(state_dir: impl AsRef<Path>) -> Result<Self> {
        let path = state_dir.as_ref().join(STATE_FILE_NAME);
        let state = match try_load_snapshot(&path)? {
            Some(snapshot) => {
                info!(
                    path = %path.display(),
                    snapshot_at = %snapshot.snapshot_at,
                    watermarks = snapshot.state.watermarks.len(),
                    "Loaded sync state"
                );
                snapshot.state
            }
            None => {
                info!(path = %path.display(), "No sync state found, starting empty");
                SyncState::new()
            }
        };
        Ok(FileStore {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a copy of the current state.
    pub fn snapshot(&self) -> SyncState {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read<R>(&self, f: impl FnOnce(&SyncState) -> R) -> R {
        f(&self.lock())
    }

    /// Applies `f` to a copy, persists the copy if it changed, then swaps it in.
    fn mutate<R>(&self, f: impl FnOnce(&mut SyncState) -> R) -> Result<R> {
        let mut guard = self.lock();
        let mut next = guard.clone();
        let result = f(&mut next);
        if next == *guard {
            return Ok(result);
        }

        let snapshot = SyncSnapshot::new(next);
        save_snapshot_atomic(&self.path, &snapshot)?;
        debug!(path = %self.path.display(), "Persisted sync state");
        *guard = snapshot.state;
        Ok(result)
    }
}

impl ProcessedStore for FileStore {
    fn find_processed(
        &self,
        subscription_resource: &SubscriptionResourceId,
        fingerprints: &[Fingerprint],
    ) -> Result<HashSet<Fingerprint>> {
        Ok(self.read(|s| s.find_processed(subscription_resource, fingerprints)))
    }

    fn record_processed(
        &self,
        subscription_resource: &SubscriptionResourceId,
        fingerprint: &Fingerprint,
        processed_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.mutate(|s| s.record_processed(subscription_resource, fingerprint, processed_at))
    }

    fn forget_processed(
        &self,
        subscription_resource: &SubscriptionResourceId,
        fingerprint: &Fingerprint,
    ) -> Result<bool> {
        self.mutate(|s| s.forget_processed(subscription_resource, fingerprint))
    }

    fn delete_processed_before(
        &self,
        subscription_resource: &SubscriptionResourceId,
        before: DateTime<Utc>,
    ) -> Result<usize> {
        self.mutate(|s| s.delete_processed_before(subscription_resource, before))
    }
}

impl QueueStore for FileStore {
    fn enqueue_request(
        &self,
        subscription_resource: &SubscriptionResourceId,
        request_id: &RequestId,
        queued_at: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        self.mutate(|s| s.enqueue_request(subscription_resource, request_id, queued_at))
    }

    fn dequeue_request(&self, subscription_resource: &SubscriptionResourceId) -> Result<bool> {
        self.mutate(|s| s.dequeue_request(subscription_resource))
    }

    fn enqueue_resource(
        &self,
        subscription_resource: &SubscriptionResourceId,
        resource_id: &ResourceId,
        request_id: &RequestId,
        queued_at: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        self.mutate(|s| {
            s.enqueue_resource(subscription_resource, resource_id, request_id, queued_at)
        })
    }

    fn dequeue_resource(
        &self,
        subscription_resource: &SubscriptionResourceId,
        resource_id: &ResourceId,
    ) -> Result<bool> {
        self.mutate(|s| s.dequeue_resource(subscription_resource, resource_id))
    }

    fn clear_requests_queued_before(&self, before: DateTime<Utc>) -> Result<usize> {
        self.mutate(|s| s.clear_requests_queued_before(before))
    }

    fn resources_queued_before(&self, before: DateTime<Utc>) -> Result<Vec<QueuedResource>> {
        Ok(self.read(|s| s.resources_queued_before(before)))
    }
}

/// One snapshot write per batch.
impl BatchStore for FileStore {
    fn mark_changes(
        &self,
        subscription_resource: &SubscriptionResourceId,
        changes: &[ChangeMark],
        request_id: &RequestId,
        at: DateTime<Utc>,
    ) -> Result<Vec<MarkOutcome>> {
        self.mutate(|s| s.mark_changes(subscription_resource, changes, request_id, at))
    }

    fn unmark_changes(
        &self,
        subscription_resource: &SubscriptionResourceId,
        fingerprints: &[Fingerprint],
        resources: &[ResourceId],
    ) -> Result<()> {
        self.mutate(|s| s.unmark_changes(subscription_resource, fingerprints, resources))
    }
}

impl WatermarkStore for FileStore {
    fn watermark(
        &self,
        subscription_resource: &SubscriptionResourceId,
    ) -> Result<Option<Watermark>> {
        Ok(self.read(|s| s.watermark(subscription_resource)))
    }

    fn advance_watermark(
        &self,
        subscription_resource: &SubscriptionResourceId,
        to: Watermark,
    ) -> Result<Watermark> {
        self.mutate(|s| s.advance_watermark(subscription_resource, to))
    }
}
