//! The change poller.
//!
//! One poll cycle discovers every remote resource of one subscription
//! resource that changed since its watermark:
//!
//! 1. `lower_bound = watermark - tolerance`; capture `poll_start`.
//! 2. Search ascending by last update; follow next-page cursors while the
//!    server provides them, then walk the chain back with previous-page
//!    cursors to catch items that moved between pages.
//! 3. When a query chain ends without reaching the reported total, restart
//!    the query at the latest timestamp seen (continuation by value).
//! 4. Deliver each change at most once per cycle, in batches.
//! 5. Return `poll_start` as the new watermark.
//!
//! Returning `poll_start` instead of the latest item timestamp under-advances
//! the watermark on purpose. A change committed on the server while the cycle
//! runs is picked up by the next cycle and filtered by the tracker if it was
//! already seen.

use std::collections::HashSet;
use std::future::Future;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use super::config::PollConfig;
use super::criteria::parse_criteria;
use super::error::PollError;
use super::source::{ChangeSource, PageCursor, SearchPage, SearchQuery};
use crate::types::{ChangeInfo, SubscriptionResource, Watermark};

/// Receives the new changes of a poll cycle, one batch at a time.
pub trait ChangeConsumer {
    type Error;

    fn accept(
        &mut self,
        batch: Vec<ChangeInfo>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Summary of a completed poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    /// `max(watermark, poll_start)`.
    pub new_watermark: Watermark,

    /// Changes handed to the consumer, after cross-page dedup.
    pub delivered: usize,

    pub pages: usize,

    /// Number of search queries issued (1 + restarts).
    pub queries: usize,

    /// Items the server returned although they were updated before the
    /// query's lower bound.
    pub below_lower_bound: usize,
}

#[derive(Debug)]
pub struct ChangePoller<S> {
    source: S,
    config: PollConfig,
}

/// Per-query-chain bookkeeping.
#[derive(Debug, Default)]
struct ChainProgress {
    seen: u64,
    total: Option<u64>,
    max_last_updated: Option<DateTime<Utc>>,
}

impl<S: ChangeSource> ChangePoller<S> {
    pub fn new(source: S, config: PollConfig) -> Self {
        ChangePoller { source, config }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Runs one poll cycle.
    ///
    /// On error the caller must not advance the watermark. A
    /// [`PollError::Stall`] needs operator attention; everything else may be
    /// retried as a whole cycle.
    #[instrument(
        skip(self, subscription, consumer),
        fields(subscription_resource = %subscription.id, %watermark)
    )]
    pub async fn poll<K>(
        &self,
        subscription: &SubscriptionResource,
        watermark: Watermark,
        consumer: &mut K,
    ) -> Result<PollOutcome, PollError<S::Error, K::Error>>
    where
        K: ChangeConsumer + Send,
    {
        let criteria = parse_criteria(subscription.criteria.as_deref())?;
        let tolerance = subscription.tolerance.unwrap_or(self.config.tolerance);
        let tolerance = chrono::Duration::from_std(tolerance).unwrap_or(chrono::Duration::MAX);
        let mut query = SearchQuery {
            resource_type: subscription.resource_type.clone(),
            criteria,
            lower_bound: watermark.lower_bound(tolerance),
            page_size: self.config.page_size,
        };

        let poll_start = Utc::now();
        let mut cycle_seen: HashSet<ChangeInfo> = HashSet::new();
        let mut previous: Option<HashSet<ChangeInfo>> = None;
        let mut outcome = PollOutcome {
            new_watermark: watermark,
            delivered: 0,
            pages: 0,
            queries: 0,
            below_lower_bound: 0,
        };

        loop {
            outcome.queries += 1;
            debug!(
                lower_bound = %query.lower_bound,
                page_size = query.page_size,
                "Searching for changed resources"
            );
            let mut page = self
                .source
                .search(&query)
                .await
                .map_err(PollError::Source)?;
            let mut chain = ChainProgress::default();
            let mut backward_from: Option<PageCursor> = None;
            let mut followed_cursor = false;

            loop {
                outcome.pages += 1;
                let page_set: HashSet<ChangeInfo> = page.items.iter().cloned().collect();
                if previous
                    .as_ref()
                    .is_some_and(|previous| is_repeated_page(previous, &page_set, &page))
                {
                    return Err(PollError::Stall {
                        subscription_resource: subscription.id.clone(),
                        lower_bound: query.lower_bound,
                        count: page.items.len(),
                    });
                }
                let early = page
                    .items
                    .iter()
                    .filter(|c| c.last_updated.is_some_and(|t| t < query.lower_bound))
                    .count();
                if early > 0 {
                    warn!(
                        min_last_updated = ?page.min_last_updated(),
                        lower_bound = %query.lower_bound,
                        count = early,
                        "Remote server returned resources updated before the lower bound"
                    );
                    outcome.below_lower_bound += early;
                }

                chain.seen += page.items.len() as u64;
                chain.total = chain.total.or(page.total);
                chain.max_last_updated = chain.max_last_updated.max(page.max_last_updated());
                outcome.delivered += self
                    .deliver(&page.items, &mut cycle_seen, consumer)
                    .await?;
                previous = Some(page_set);

                if page.items.is_empty() {
                    break;
                }
                backward_from = page.previous.take();
                match page.next.take() {
                    Some(cursor) => {
                        followed_cursor = true;
                        page = self
                            .source
                            .next_page(&cursor)
                            .await
                            .map_err(PollError::Source)?;
                    }
                    None => break,
                }
            }

            // Cursor paging is not guaranteed to be stable: a resource
            // updated while paging moves behind the cursor. Walking back
            // over the chain picks those up; repeats are filtered.
            if followed_cursor {
                self.walk_backwards(backward_from, &mut cycle_seen, consumer, &mut outcome)
                    .await?;
            }

            if chain.seen == 0 {
                break;
            }
            let total = match chain.total {
                Some(total) => Some(total),
                None => self
                    .source
                    .total_count(&query)
                    .await
                    .map_err(PollError::Source)?,
            };

            match total {
                None => {
                    warn!(
                        observed = chain.seen,
                        "Remote server does not report a total count; changes beyond the last page may be missed this cycle"
                    );
                    break;
                }
                Some(total) if chain.seen >= total => {
                    if chain.seen > total {
                        warn!(
                            observed = chain.seen,
                            total, "Remote server returned more resources than its reported total"
                        );
                    }
                    break;
                }
                Some(total) => {
                    debug!(
                        returned = chain.seen,
                        total, "Partial result without further pages"
                    );
                    match chain.max_last_updated {
                        None => {
                            warn!(
                                observed = chain.seen,
                                total,
                                "Remote server does not report last-updated timestamps; cannot continue past the last page"
                            );
                            break;
                        }
                        Some(max_seen) if max_seen > query.lower_bound => {
                            query = query.restarted_at(max_seen);
                        }
                        Some(_) => {
                            return Err(PollError::Stall {
                                subscription_resource: subscription.id.clone(),
                                lower_bound: query.lower_bound,
                                count: chain.seen as usize,
                            });
                        }
                    }
                }
            }
        }

        let start = Watermark::new(poll_start);
        if start < watermark {
            debug!(%start, "Poll started before the stored watermark; keeping it");
        }
        outcome.new_watermark = watermark.advance(start);
        debug!(
            delivered = outcome.delivered,
            pages = outcome.pages,
            queries = outcome.queries,
            new_watermark = %outcome.new_watermark,
            "Poll cycle completed"
        );
        Ok(outcome)
    }

    /// Follows previous-page cursors from `cursor` until the server runs
    /// out of pages.
    async fn walk_backwards<K>(
        &self,
        mut cursor: Option<PageCursor>,
        cycle_seen: &mut HashSet<ChangeInfo>,
        consumer: &mut K,
        outcome: &mut PollOutcome,
    ) -> Result<(), PollError<S::Error, K::Error>>
    where
        K: ChangeConsumer + Send,
    {
        while let Some(current) = cursor.take() {
            let mut page = self
                .source
                .previous_page(&current)
                .await
                .map_err(PollError::Source)?;
            if page.items.is_empty() {
                break;
            }
            outcome.pages += 1;
            let fresh = self.deliver(&page.items, cycle_seen, consumer).await?;
            if fresh > 0 {
                debug!(fresh, "Backward paging found resources skipped by forward paging");
            }
            outcome.delivered += fresh;
            cursor = page.previous.take();
        }
        Ok(())
    }

    /// Hands not-yet-seen changes to the consumer in bounded batches.
    async fn deliver<K>(
        &self,
        items: &[ChangeInfo],
        cycle_seen: &mut HashSet<ChangeInfo>,
        consumer: &mut K,
    ) -> Result<usize, PollError<S::Error, K::Error>>
    where
        K: ChangeConsumer + Send,
    {
        let fresh: Vec<ChangeInfo> = items
            .iter()
            .filter(|item| cycle_seen.insert((*item).clone()))
            .cloned()
            .collect();
        let delivered = fresh.len();
        for batch in fresh.chunks(self.config.max_batch_size.max(1)) {
            consumer
                .accept(batch.to_vec())
                .await
                .map_err(PollError::Consumer)?;
        }
        Ok(delivered)
    }
}

/// A non-empty page that only repeats what the previous page returned, while
/// the server claims there is more, means the server is not advancing.
fn is_repeated_page(
    previous: &HashSet<ChangeInfo>,
    current: &HashSet<ChangeInfo>,
    page: &SearchPage,
) -> bool {
    !current.is_empty()
        && current.is_subset(previous)
        && previous.len() >= page.items.len()
        && page.total.is_none_or(|total| (page.items.len() as u64) < total)
}

#[cfg(test)]
#[path = "poller_tests.rs"]
mod tests;
