//! Change notifications and watermarks.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::ids::ResourceId;

/// A changed remote resource as reported by one search page.
///
/// Equality covers all three fields. The poller uses it for cross-page
/// dedup, and the tracker turns it into a [`crate::tracker::Fingerprint`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeInfo {
    pub id: ResourceId,
    pub last_updated: Option<DateTime<Utc>>,
    pub version: Option<String>,
}

impl ChangeInfo {
    pub fn new(
        id: impl Into<String>,
        last_updated: Option<DateTime<Utc>>,
        version: Option<String>,
    ) -> Self {
        ChangeInfo {
            id: ResourceId::new(id),
            last_updated,
            version,
        }
    }
}

/// Per-subscription timestamp boundary below which all remote changes are
/// assumed processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermark(pub DateTime<Utc>);

impl Watermark {
    /// Watermark of a subscription resource that has never been polled.
    pub const MIN: Watermark = Watermark(DateTime::<Utc>::UNIX_EPOCH);

    pub fn new(at: DateTime<Utc>) -> Self {
        Watermark(at)
    }

    pub fn at(&self) -> DateTime<Utc> {
        self.0
    }

    /// Returns the later of the two watermarks.
    pub fn advance(self, to: Watermark) -> Watermark {
        self.max(to)
    }

    /// Lower bound of the first query of a poll cycle.
    pub fn lower_bound(&self, tolerance: Duration) -> DateTime<Utc> {
        self.0
            .checked_sub_signed(tolerance)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}
