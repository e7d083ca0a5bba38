//! Flushing cached mutations to the remote system.

use std::any::Any;
use std::future::Future;

use crate::types::{ResourceId, ResourceKey};

use super::resource::Resource;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistStatus {
    Ok,
    NotFound,
    Failed { message: String },
}

/// Outcome of one item of a batched remote operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistResult {
    pub resource_id: ResourceId,
    pub status: PersistStatus,
}

impl PersistResult {
    pub fn ok(resource_id: ResourceId) -> Self {
        PersistResult {
            resource_id,
            status: PersistStatus::Ok,
        }
    }

    pub fn failed(resource_id: ResourceId, message: impl Into<String>) -> Self {
        PersistResult {
            resource_id,
            status: PersistStatus::Failed {
                message: message.into(),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == PersistStatus::Ok
    }
}

/// Batched remote writes for one resource type.
///
/// Failures are reported per item. Items that succeeded stay persisted even
/// when others in the same batch fail.
pub trait PersistCallback<T: Resource>: Send + Sync + 'static {
    /// Creates (`create == true`) or updates `resources` remotely.
    fn persist_save(
        &self,
        resources: Vec<T>,
        create: bool,
    ) -> impl Future<Output = Vec<PersistResult>> + Send;

    fn persist_delete(&self, ids: Vec<ResourceId>) -> impl Future<Output = Vec<PersistResult>> + Send;
}

/// One flushed item, reported to a [`FlushObserver`].
#[derive(Clone, Copy)]
pub struct Persisted<'a> {
    pub resource_type: &'static str,
    pub resource: &'a dyn Any,
    pub resource_key: Option<&'a ResourceKey>,
    pub result: &'a PersistResult,
}

impl<'a> Persisted<'a> {
    /// The original resource, if it is a `T`.
    pub fn resource<T: Resource>(&self) -> Option<&'a T> {
        self.resource.downcast_ref()
    }
}

/// Receives the outcome of every flushed item, keyed by the resource and the
/// key it was saved or deleted with.
pub trait FlushObserver: Send {
    fn persisted(&mut self, item: Persisted<'_>);
}

impl<F: FnMut(Persisted<'_>) + Send> FlushObserver for F {
    fn persisted(&mut self, item: Persisted<'_>) {
        self(item)
    }
}
