//! Scenario tests for the change poller against a simulated remote server.

use std::time::Duration;

use proptest::prelude::*;

use super::*;
use crate::retry::{ErrorKind, Retriable};
use crate::test_utils::{ScriptedSource, ServerBehavior, SourceError, at, change};
use crate::types::SubscriptionResource;

#[derive(Debug, Default)]
struct Collect {
    batches: Vec<Vec<ChangeInfo>>,
    fail_with: Option<SourceError>,
}

impl Collect {
    fn ids(&self) -> Vec<String> {
        self.batches
            .iter()
            .flatten()
            .map(|c| c.id.to_string())
            .collect()
    }
}

impl ChangeConsumer for Collect {
    type Error = SourceError;

    async fn accept(&mut self, batch: Vec<ChangeInfo>) -> Result<(), SourceError> {
        if let Some(error) = self.fail_with.clone() {
            return Err(error);
        }
        self.batches.push(batch);
        Ok(())
    }
}

fn subscription() -> SubscriptionResource {
    SubscriptionResource::new("sr-1", "s-1", "Observation").with_tolerance(Duration::ZERO)
}

fn poller(source: ScriptedSource, page_size: usize) -> ChangePoller<ScriptedSource> {
    ChangePoller::new(source, PollConfig::new().with_page_size(page_size))
}

fn three_items() -> Vec<ChangeInfo> {
    vec![change("1", 1001), change("2", 1002), change("3", 1003)]
}

#[tokio::test]
async fn restarts_by_value_when_server_has_no_cursor() {
    let source = ScriptedSource::new(three_items(), ServerBehavior::default());
    let poller = poller(source, 2);
    let mut consumer = Collect::default();

    let before = Utc::now();
    let outcome = poller
        .poll(&subscription(), Watermark::new(at(1000)), &mut consumer)
        .await
        .unwrap();
    let after = Utc::now();

    assert_eq!(consumer.ids(), vec!["1", "2", "3"]);
    assert_eq!(consumer.batches.len(), 2, "id 2 is filtered on the second page");
    assert_eq!(outcome.delivered, 3);
    assert_eq!(outcome.queries, 2);

    let queries = poller.source().queries();
    assert_eq!(queries[0].lower_bound, at(1000));
    assert_eq!(queries[1].lower_bound, at(1002));

    // The watermark is the cycle start, not the latest item.
    assert_ne!(outcome.new_watermark, Watermark::new(at(1003)));
    assert!(outcome.new_watermark.at() >= before);
    assert!(outcome.new_watermark.at() <= after);
}

#[tokio::test]
async fn follows_cursors_without_restarting() {
    let items: Vec<_> = (1..=5).map(|i| change(&i.to_string(), 1000 + i)).collect();
    let behavior = ServerBehavior {
        cursors: true,
        ..ServerBehavior::default()
    };
    let poller = poller(ScriptedSource::new(items, behavior), 2);
    let mut consumer = Collect::default();

    let outcome = poller
        .poll(&subscription(), Watermark::new(at(1000)), &mut consumer)
        .await
        .unwrap();

    assert_eq!(outcome.queries, 1);
    assert_eq!(outcome.pages, 3);
    assert_eq!(consumer.ids(), vec!["1", "2", "3", "4", "5"]);
}

#[tokio::test]
async fn walks_back_over_cursor_chain_for_items_that_moved() {
    let items: Vec<_> = (1..=4).map(|i| change(&i.to_string(), 1000 + i)).collect();
    let behavior = ServerBehavior {
        cursors: true,
        previous_cursors: true,
        ..ServerBehavior::default()
    };
    let source = ScriptedSource::new(items, behavior);
    // Sorts before everything on the first page, so forward paging misses it.
    source.arrive_while_paging(change("0", 1000));
    let poller = poller(source, 2);
    let mut consumer = Collect::default();

    let outcome = poller
        .poll(&subscription(), Watermark::new(at(1000)), &mut consumer)
        .await
        .unwrap();

    assert_eq!(consumer.ids(), vec!["1", "2", "3", "4", "0"]);
    assert_eq!(outcome.delivered, 5);
    assert_eq!(outcome.queries, 1);
    assert_eq!(poller.source().previous_pages(), 2);
}

#[tokio::test]
async fn without_previous_cursors_nothing_is_walked_back() {
    let items: Vec<_> = (1..=4).map(|i| change(&i.to_string(), 1000 + i)).collect();
    let behavior = ServerBehavior {
        cursors: true,
        ..ServerBehavior::default()
    };
    let poller = poller(ScriptedSource::new(items, behavior), 2);
    let mut consumer = Collect::default();

    poller
        .poll(&subscription(), Watermark::new(at(1000)), &mut consumer)
        .await
        .unwrap();

    assert_eq!(poller.source().previous_pages(), 0);
}

#[tokio::test]
async fn counts_items_updated_before_the_lower_bound() {
    let behavior = ServerBehavior {
        ignore_lower_bound: true,
        ..ServerBehavior::default()
    };
    let items = vec![change("old", 900), change("1", 1001)];
    let poller = poller(ScriptedSource::new(items, behavior), 10);
    let mut consumer = Collect::default();

    let outcome = poller
        .poll(&subscription(), Watermark::new(at(1000)), &mut consumer)
        .await
        .unwrap();

    assert_eq!(outcome.below_lower_bound, 1);
    assert_eq!(consumer.ids(), vec!["old", "1"]);
}

#[tokio::test]
async fn stalls_when_server_repeats_the_same_page() {
    let behavior = ServerBehavior {
        ignore_lower_bound: true,
        ..ServerBehavior::default()
    };
    let poller = poller(ScriptedSource::new(three_items(), behavior), 2);
    let mut consumer = Collect::default();

    let err = poller
        .poll(&subscription(), Watermark::new(at(1000)), &mut consumer)
        .await
        .unwrap_err();

    match &err {
        PollError::Stall {
            lower_bound, count, ..
        } => {
            assert_eq!(*lower_bound, at(1002));
            assert_eq!(*count, 2);
        }
        other => panic!("Expected Stall, got {:?}", other),
    }
    assert_eq!(err.kind(), ErrorKind::Permanent);
}

#[tokio::test]
async fn stalls_when_lower_bound_cannot_advance() {
    // More resources share one timestamp than fit on a page.
    let items = vec![change("a", 1000), change("b", 1000), change("c", 1000)];
    let poller = poller(ScriptedSource::new(items, ServerBehavior::default()), 2);
    let mut consumer = Collect::default();

    let err = poller
        .poll(&subscription(), Watermark::new(at(1000)), &mut consumer)
        .await
        .unwrap_err();

    assert!(matches!(err, PollError::Stall { lower_bound, .. } if lower_bound == at(1000)));
}

#[tokio::test]
async fn batches_respect_max_batch_size() {
    let items: Vec<_> = (1..=5).map(|i| change(&i.to_string(), 1000 + i)).collect();
    let config = PollConfig::new().with_page_size(10).with_max_batch_size(2);
    let poller = ChangePoller::new(ScriptedSource::new(items, ServerBehavior::default()), config);
    let mut consumer = Collect::default();

    poller
        .poll(&subscription(), Watermark::new(at(1000)), &mut consumer)
        .await
        .unwrap();

    let sizes: Vec<usize> = consumer.batches.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![2, 2, 1]);
}

#[tokio::test]
async fn without_total_count_stops_after_first_chain() {
    let behavior = ServerBehavior {
        total_on_page: false,
        ..ServerBehavior::default()
    };
    let poller = poller(ScriptedSource::new(three_items(), behavior), 2);
    let mut consumer = Collect::default();

    let outcome = poller
        .poll(&subscription(), Watermark::new(at(1000)), &mut consumer)
        .await
        .unwrap();

    assert_eq!(outcome.queries, 1);
    assert_eq!(consumer.ids(), vec!["1", "2"]);
}

#[tokio::test]
async fn count_probe_replaces_missing_page_total() {
    let behavior = ServerBehavior {
        total_on_page: false,
        total_probe: true,
        ..ServerBehavior::default()
    };
    let poller = poller(ScriptedSource::new(three_items(), behavior), 2);
    let mut consumer = Collect::default();

    let outcome = poller
        .poll(&subscription(), Watermark::new(at(1000)), &mut consumer)
        .await
        .unwrap();

    assert_eq!(outcome.queries, 2);
    assert_eq!(consumer.ids(), vec!["1", "2", "3"]);
}

#[tokio::test]
async fn without_timestamps_stops_after_first_chain() {
    let items = vec![
        ChangeInfo::new("1", None, Some("1".into())),
        ChangeInfo::new("2", None, Some("1".into())),
        ChangeInfo::new("3", None, Some("1".into())),
    ];
    let poller = poller(ScriptedSource::new(items, ServerBehavior::default()), 2);
    let mut consumer = Collect::default();

    let outcome = poller
        .poll(&subscription(), Watermark::new(at(1000)), &mut consumer)
        .await
        .unwrap();

    assert_eq!(outcome.queries, 1);
    assert_eq!(outcome.delivered, 2);
}

#[tokio::test]
async fn tolerance_lowers_the_first_query() {
    let subscription = SubscriptionResource::new("sr-1", "s-1", "Patient");
    let poller = poller(ScriptedSource::new(vec![], ServerBehavior::default()), 2);

    poller
        .poll(&subscription, Watermark::new(at(1000)), &mut Collect::default())
        .await
        .unwrap();

    assert_eq!(poller.source().queries()[0].lower_bound, at(995));
    assert_eq!(poller.source().queries()[0].resource_type, "Patient");
}

#[tokio::test]
async fn source_error_propagates_as_transient() {
    let source = ScriptedSource::new(three_items(), ServerBehavior::default());
    source.fail_next(SourceError::transient("connection reset"));
    let poller = poller(source, 2);

    let err = poller
        .poll(&subscription(), Watermark::new(at(1000)), &mut Collect::default())
        .await
        .unwrap_err();

    assert!(matches!(err, PollError::Source(_)));
    assert!(err.is_transient());
}

#[tokio::test]
async fn consumer_error_aborts_the_cycle() {
    let poller = poller(ScriptedSource::new(three_items(), ServerBehavior::default()), 2);
    let mut consumer = Collect {
        fail_with: Some(SourceError::transient("broker down")),
        ..Collect::default()
    };

    let err = poller
        .poll(&subscription(), Watermark::new(at(1000)), &mut consumer)
        .await
        .unwrap_err();

    assert!(matches!(err, PollError::Consumer(_)));
    assert_eq!(poller.source().queries().len(), 1);
}

#[tokio::test]
async fn invalid_criteria_fail_before_any_search() {
    let subscription = subscription().with_criteria("?code=%FF");
    let poller = poller(ScriptedSource::new(three_items(), ServerBehavior::default()), 2);

    let err = poller
        .poll(&subscription, Watermark::new(at(1000)), &mut Collect::default())
        .await
        .unwrap_err();

    assert!(matches!(err, PollError::InvalidCriteria(_)));
    assert!(poller.source().queries().is_empty());
}

#[tokio::test]
async fn criteria_are_passed_to_the_source() {
    let subscription = subscription().with_criteria("?status=final&_count=7");
    let poller = poller(ScriptedSource::new(vec![], ServerBehavior::default()), 2);

    poller
        .poll(&subscription, Watermark::new(at(1000)), &mut Collect::default())
        .await
        .unwrap();

    let query = &poller.source().queries()[0];
    assert_eq!(query.criteria, vec![("status".to_string(), "final".to_string())]);
    assert_eq!(query.page_size, 2);
}

proptest! {
    /// A future watermark is kept; a past one moves to the cycle start.
    #[test]
    fn new_watermark_never_regresses(secs in 0i64..4_102_444_800) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let poller = poller(ScriptedSource::new(vec![], ServerBehavior::default()), 2);
        let watermark = Watermark::new(at(secs));

        let outcome = rt
            .block_on(poller.poll(&subscription(), watermark, &mut Collect::default()))
            .unwrap();

        prop_assert!(outcome.new_watermark >= watermark);
    }

    /// With stable cursors every matching resource is delivered exactly once.
    #[test]
    fn stable_paging_delivers_reported_total(count in 0usize..40, page_size in 1usize..8) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let items: Vec<_> = (0..count)
            .map(|i| change(&format!("r{}", i), 2000 + i as i64))
            .collect();
        let behavior = ServerBehavior { cursors: true, ..ServerBehavior::default() };
        let poller = poller(ScriptedSource::new(items, behavior), page_size);
        let mut consumer = Collect::default();

        let outcome = rt
            .block_on(poller.poll(&subscription(), Watermark::new(at(1000)), &mut consumer))
            .unwrap();

        prop_assert_eq!(outcome.delivered, count);
        prop_assert_eq!(outcome.queries, 1);
    }

    /// Without cursors, continuation by value still reaches every resource
    /// as long as timestamps are distinct.
    #[test]
    fn restart_paging_delivers_every_resource(count in 0usize..30, page_size in 2usize..6) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let items: Vec<_> = (0..count)
            .map(|i| change(&format!("r{}", i), 2000 + i as i64))
            .collect();
        let poller = poller(ScriptedSource::new(items, ServerBehavior::default()), page_size);
        let mut consumer = Collect::default();

        let outcome = rt
            .block_on(poller.poll(&subscription(), Watermark::new(at(1000)), &mut consumer))
            .unwrap();

        let mut ids = consumer.ids();
        ids.sort();
        ids.dedup();
        prop_assert_eq!(ids.len(), count);
        prop_assert_eq!(outcome.delivered, count);
    }
}
