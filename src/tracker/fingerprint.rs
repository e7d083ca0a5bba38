//! Fingerprints of processed remote resource versions.
//!
//! A remote server may report the same resource state in several poll
//! cycles (the watermark deliberately under-advances, and the clock-skew
//! tolerance re-reads the tail of the previous cycle). A fingerprint
//! identifies one specific state of one resource so that each state is
//! enqueued at most once.
//!
//! # Format
//!
//! `<id>|<version>|<timestamp>` where
//!
//! - `<version>` is the resource version, or `-` when the server does not
//!   report versions
//! - `<timestamp>` is the last-updated time in epoch milliseconds, or
//!   `p<millis>` (the poll-processing time) when the server does not report
//!   last-updated timestamps
//!
//! Separators inside the id and version are escaped so that distinct
//! states can never produce the same key.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ChangeInfo;

/// Placeholder used when a change carries no version.
const NO_VERSION: &str = "-";

/// A dedup key identifying one processed state of a remote resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Computes the fingerprint of a change observed during a poll cycle that
    /// is processed at `processed_at`.
    ///
    /// Changes without a last-updated timestamp get a placeholder tied to
    /// `processed_at`, so they are considered new once per processing batch.
    pub fn of(change: &ChangeInfo, processed_at: DateTime<Utc>) -> Self {
        let version = change
            .version
            .as_deref()
            .map(escape)
            .unwrap_or_else(|| NO_VERSION.to_string());
        let timestamp = match change.last_updated {
            Some(last_updated) => last_updated.timestamp_millis().to_string(),
            None => format!("p{}", processed_at.timestamp_millis()),
        };
        Fingerprint(format!(
            "{}|{}|{}",
            escape(change.id.as_str()),
            version,
            timestamp
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Escapes backslashes first, then separators, to allow unambiguous parsing.
/// A bare `-` is escaped too so a real version `-` differs from "no version".
fn escape(part: &str) -> String {
    if part == NO_VERSION {
        return "\\-".to_string();
    }
    part.replace('\\', "\\\\").replace('|', "\\|")
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Fingerprint {
    fn from(s: String) -> Self {
        Fingerprint(s)
    }
}
