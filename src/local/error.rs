use thiserror::Error;

use crate::retry::{ErrorKind, Retriable};
use crate::types::ResourceId;

/// Data-integrity errors of the local resource cache. These never reach the
/// remote system and are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocalError {
    #[error("{resource_type} {id}: parent must not change (cached {cached:?}, given {given:?})")]
    CorrelationMismatch {
        resource_type: &'static str,
        id: ResourceId,
        cached: Option<ResourceId>,
        given: Option<ResourceId>,
    },

    #[error("{resource_type} has no parent correlation")]
    CorrelationUnsupported { resource_type: &'static str },

    #[error("{resource_type} {id} was deleted in this scope")]
    Deleted {
        resource_type: &'static str,
        id: ResourceId,
    },

    #[error("{resource_type} fetched from the remote system has no id")]
    MissingId { resource_type: &'static str },

    #[error("resource type is not supported: {0}")]
    UnsupportedResourceType(&'static str),
}

impl Retriable for LocalError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Permanent
    }
}

pub type Result<T> = std::result::Result<T, LocalError>;
