//! The remote search interface the poller drives.
//!
//! Transport, authentication and response parsing live in the implementor.
//! The poller only needs ascending-by-update paged search, optional opaque
//! next/previous-page cursors and an optional total-count probe.

use std::future::Future;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::retry::Retriable;
use crate::types::ChangeInfo;

/// One search against the remote server, sorted ascending by last update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub resource_type: String,

    /// Decoded caller criteria, in order.
    pub criteria: Vec<(String, String)>,

    /// Inclusive lower bound on the last-updated timestamp.
    pub lower_bound: DateTime<Utc>,

    pub page_size: usize,
}

impl SearchQuery {
    /// Returns the same query with a different lower bound.
    pub fn restarted_at(&self, lower_bound: DateTime<Utc>) -> Self {
        SearchQuery {
            lower_bound,
            ..self.clone()
        }
    }

    /// Query parameters for a FHIR-style REST search.
    ///
    /// Only `id` and `meta` are requested; the consumer fetches full
    /// resources later.
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = self.criteria.clone();
        pairs.push((
            "_lastUpdated".to_string(),
            format!(
                "ge{}",
                self.lower_bound.to_rfc3339_opts(SecondsFormat::Millis, true)
            ),
        ));
        pairs.push(("_sort".to_string(), "_lastUpdated".to_string()));
        pairs.push(("_count".to_string(), self.page_size.to_string()));
        pairs.push(("_elements".to_string(), "meta,id".to_string()));
        pairs
    }

    /// Percent-encoded query string without the leading `?`.
    pub fn to_query_string(&self) -> String {
        self.to_query_pairs()
            .iter()
            .map(|(name, value)| {
                format!(
                    "{}={}",
                    urlencoding::encode(name),
                    urlencoding::encode(value)
                )
            })
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// Opaque page link returned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageCursor(pub String);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPage {
    pub items: Vec<ChangeInfo>,

    /// Total number of matches for the query, if the server reports it.
    pub total: Option<u64>,

    /// Next-page cursor, if the server supports paging.
    pub next: Option<PageCursor>,

    /// Previous-page cursor. Used to walk a cursor chain backwards and pick
    /// up items that shifted between pages while paging forwards.
    pub previous: Option<PageCursor>,
}

impl SearchPage {
    pub fn new(items: Vec<ChangeInfo>) -> Self {
        SearchPage {
            items,
            total: None,
            next: None,
            previous: None,
        }
    }

    pub fn with_total(mut self, total: u64) -> Self {
        self.total = Some(total);
        self
    }

    pub fn with_next(mut self, cursor: impl Into<String>) -> Self {
        self.next = Some(PageCursor(cursor.into()));
        self
    }

    pub fn with_previous(mut self, cursor: impl Into<String>) -> Self {
        self.previous = Some(PageCursor(cursor.into()));
        self
    }

    /// Earliest last-updated timestamp on this page.
    pub fn min_last_updated(&self) -> Option<DateTime<Utc>> {
        self.items.iter().filter_map(|c| c.last_updated).min()
    }

    /// Latest last-updated timestamp on this page.
    pub fn max_last_updated(&self) -> Option<DateTime<Utc>> {
        self.items.iter().filter_map(|c| c.last_updated).max()
    }
}

/// Paged change search against the remote system.
///
/// Network timeouts must surface as errors whose [`Retriable::kind`] is
/// transient.
pub trait ChangeSource: Send + Sync {
    type Error: std::error::Error + Retriable + Send + Sync + 'static;

    fn search(
        &self,
        query: &SearchQuery,
    ) -> impl Future<Output = Result<SearchPage, Self::Error>> + Send;

    fn next_page(
        &self,
        cursor: &PageCursor,
    ) -> impl Future<Output = Result<SearchPage, Self::Error>> + Send;

    /// Follows a previous-page cursor. Servers that never hand out
    /// previous-page cursors need not implement it.
    fn previous_page(
        &self,
        _cursor: &PageCursor,
    ) -> impl Future<Output = Result<SearchPage, Self::Error>> + Send {
        async { Ok(SearchPage::default()) }
    }

    /// Count-only probe for servers that omit the total from search pages.
    fn total_count(
        &self,
        _query: &SearchQuery,
    ) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send {
        async { Ok(None) }
    }
}
