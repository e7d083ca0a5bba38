//! Poll cycle errors.

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::criteria::CriteriaError;
use crate::retry::{ErrorKind, Retriable};
use crate::types::SubscriptionResourceId;

/// A failed poll cycle. The watermark is never advanced on error.
///
/// `S` is the change source's error, `C` the batch consumer's.
#[derive(Debug, Error)]
pub enum PollError<S, C> {
    #[error("remote search failed: {0}")]
    Source(#[source] S),

    #[error("consuming polled changes failed: {0}")]
    Consumer(#[source] C),

    /// The server returned the same result again for an unchanged lower
    /// bound. Retrying cannot help; the tolerance or criteria need fixing.
    #[error(
        "subscription resource {subscription_resource} returned the same {count} resources again for lower bound {lower_bound}"
    )]
    Stall {
        subscription_resource: SubscriptionResourceId,
        lower_bound: DateTime<Utc>,
        count: usize,
    },

    #[error(transparent)]
    InvalidCriteria(#[from] CriteriaError),
}

impl<S: Retriable, C: Retriable> Retriable for PollError<S, C> {
    fn kind(&self) -> ErrorKind {
        match self {
            PollError::Source(e) => e.kind(),
            PollError::Consumer(e) => e.kind(),
            PollError::Stall { .. } | PollError::InvalidCriteria(_) => ErrorKind::Permanent,
        }
    }
}
