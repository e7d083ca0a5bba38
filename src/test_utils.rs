//! Shared test doubles and generators.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use proptest::prelude::*;
use thiserror::Error;

use crate::local::{PersistCallback, PersistResult, Resource};
use crate::poll::{ChangeSource, PageCursor, SearchPage, SearchQuery};
use crate::queue::{Broker, QueueMessage};
use crate::retry::{ErrorKind, Retriable};
use crate::types::{ChangeInfo, ResourceId};

pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

pub fn change(id: &str, secs: i64) -> ChangeInfo {
    ChangeInfo::new(id, Some(at(secs)), None)
}

pub fn arb_datetime() -> impl Strategy<Value = DateTime<Utc>> {
    (946_684_800i64..4_102_444_800i64).prop_map(at)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("scripted source failure: {message}")]
pub struct SourceError {
    pub transient: bool,
    pub message: String,
}

impl SourceError {
    pub fn transient(message: &str) -> Self {
        SourceError {
            transient: true,
            message: message.to_string(),
        }
    }
}

impl Retriable for SourceError {
    fn kind(&self) -> ErrorKind {
        if self.transient {
            ErrorKind::Transient
        } else {
            ErrorKind::Permanent
        }
    }
}

/// How the simulated server pages and counts.
#[derive(Debug, Clone, Copy)]
pub struct ServerBehavior {
    /// Emit next-page cursors.
    pub cursors: bool,
    /// Emit previous-page cursors alongside next-page cursors.
    pub previous_cursors: bool,
    /// Report `total` on search pages.
    pub total_on_page: bool,
    /// Answer the separate count probe.
    pub total_probe: bool,
    /// Ignore the lower bound entirely (a non-conformant server).
    pub ignore_lower_bound: bool,
}

impl Default for ServerBehavior {
    fn default() -> Self {
        ServerBehavior {
            cursors: false,
            previous_cursors: false,
            total_on_page: true,
            total_probe: false,
            ignore_lower_bound: false,
        }
    }
}

/// An in-memory remote server answering `_lastUpdated=ge` searches.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    items: Mutex<Vec<ChangeInfo>>,
    behavior: ServerBehavior,
    failures: Mutex<VecDeque<SourceError>>,
    queries: Mutex<Vec<SearchQuery>>,
    /// Added to `items` right before the next `next_page` answer.
    late_arrivals: Mutex<Vec<ChangeInfo>>,
    previous_pages: Mutex<usize>,
}

impl ScriptedSource {
    pub fn new(items: Vec<ChangeInfo>, behavior: ServerBehavior) -> Self {
        ScriptedSource {
            items: Mutex::new(items),
            behavior,
            failures: Mutex::new(VecDeque::new()),
            queries: Mutex::new(Vec::new()),
            late_arrivals: Mutex::new(Vec::new()),
            previous_pages: Mutex::new(0),
        }
    }

    /// Makes `item` appear while the poller is between pages, shifting the
    /// offsets of every later page.
    pub fn arrive_while_paging(&self, item: ChangeInfo) {
        self.late_arrivals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(item);
    }

    /// Number of `previous_page` calls answered.
    pub fn previous_pages(&self) -> usize {
        *self.previous_pages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_items(&self, items: Vec<ChangeInfo>) {
        *self.items.lock().unwrap_or_else(PoisonError::into_inner) = items;
    }

    /// Queues an error returned by the next search call.
    pub fn fail_next(&self, error: SourceError) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
    }

    /// Every query sent to `search`, in order.
    pub fn queries(&self) -> Vec<SearchQuery> {
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn matching(&self, lower_bound: DateTime<Utc>) -> Vec<ChangeInfo> {
        let mut matching: Vec<ChangeInfo> = self
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| {
                self.behavior.ignore_lower_bound
                    || c.last_updated.is_none_or(|t| t >= lower_bound)
            })
            .cloned()
            .collect();
        matching.sort_by_key(|c| c.last_updated);
        matching
    }

    fn page(&self, lower_bound: DateTime<Utc>, page_size: usize, offset: usize) -> SearchPage {
        let matching = self.matching(lower_bound);
        let total = matching.len();
        let items: Vec<ChangeInfo> = matching.into_iter().skip(offset).take(page_size).collect();
        let next_offset = offset + items.len();
        let cursor = |offset: usize| {
            PageCursor(format!(
                "{}|{}|{}",
                lower_bound.timestamp_millis(),
                page_size,
                offset
            ))
        };
        SearchPage {
            total: self.behavior.total_on_page.then_some(total as u64),
            next: (self.behavior.cursors && !items.is_empty() && next_offset < total)
                .then(|| cursor(next_offset)),
            previous: (self.behavior.previous_cursors && offset > 0)
                .then(|| cursor(offset.saturating_sub(page_size))),
            items,
        }
    }

    fn follow(&self, cursor: &PageCursor) -> Result<SearchPage, SourceError> {
        let parts: Vec<&str> = cursor.0.split('|').collect();
        let lower_bound = parts
            .first()
            .and_then(|s| s.parse().ok())
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| SourceError::transient("bad cursor"))?;
        let page_size = parts.get(1).and_then(|s| s.parse().ok()).unwrap_or(1);
        let offset = parts.get(2).and_then(|s| s.parse().ok()).unwrap_or(0);
        Ok(self.page(lower_bound, page_size, offset))
    }

    fn take_failure(&self) -> Option<SourceError> {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

impl ChangeSource for ScriptedSource {
    type Error = SourceError;

    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, SourceError> {
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(query.clone());
        if let Some(error) = self.take_failure() {
            return Err(error);
        }
        Ok(self.page(query.lower_bound, query.page_size, 0))
    }

    async fn next_page(&self, cursor: &PageCursor) -> Result<SearchPage, SourceError> {
        let arrived =
            std::mem::take(&mut *self.late_arrivals.lock().unwrap_or_else(PoisonError::into_inner));
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(arrived);
        self.follow(cursor)
    }

    async fn previous_page(&self, cursor: &PageCursor) -> Result<SearchPage, SourceError> {
        *self.previous_pages.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        self.follow(cursor)
    }

    async fn total_count(&self, query: &SearchQuery) -> Result<Option<u64>, SourceError> {
        Ok(self
            .behavior
            .total_probe
            .then(|| self.matching(query.lower_bound).len() as u64))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("recording broker refused the message")]
pub struct RefusedError;

impl Retriable for RefusedError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Transient
    }
}

/// A broker that records published messages instead of delivering them.
#[derive(Debug, Default)]
pub struct RecordingBroker {
    published: Mutex<Vec<QueueMessage>>,
    refuse: Mutex<usize>,
    volatile: bool,
}

impl RecordingBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker whose messages are lost on restart.
    pub fn volatile() -> Self {
        RecordingBroker {
            volatile: true,
            ..Self::default()
        }
    }

    /// Refuses the next `n` publishes.
    pub fn refuse_next(&self, n: usize) {
        *self.refuse.lock().unwrap_or_else(PoisonError::into_inner) = n;
    }

    pub fn published(&self) -> Vec<QueueMessage> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Removes and returns everything published so far.
    pub fn drain(&self) -> Vec<QueueMessage> {
        std::mem::take(&mut *self.published.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Broker for RecordingBroker {
    type Error = RefusedError;

    async fn publish(&self, message: QueueMessage) -> Result<(), RefusedError> {
        {
            let mut refuse = self.refuse.lock().unwrap_or_else(PoisonError::into_inner);
            if *refuse > 0 {
                *refuse -= 1;
                return Err(RefusedError);
            }
        }
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
        Ok(())
    }

    fn is_durable(&self) -> bool {
        !self.volatile
    }
}

/// A cached resource type owned by a parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enrollment {
    pub id: Option<ResourceId>,
    pub new: bool,
    pub parent: Option<ResourceId>,
    pub status: String,
}

impl Enrollment {
    /// A resource read from the remote system.
    pub fn existing(id: &str, parent: &str, status: &str) -> Self {
        Enrollment {
            id: Some(ResourceId::new(id)),
            new: false,
            parent: Some(ResourceId::new(parent)),
            status: status.to_string(),
        }
    }

    /// A resource created locally, without an id yet.
    pub fn created(parent: &str, status: &str) -> Self {
        Enrollment {
            id: None,
            new: true,
            parent: Some(ResourceId::new(parent)),
            status: status.to_string(),
        }
    }
}

impl Resource for Enrollment {
    const TYPE_NAME: &'static str = "Enrollment";
    const HAS_PARENT: bool = true;

    fn id(&self) -> Option<&ResourceId> {
        self.id.as_ref()
    }

    fn set_id(&mut self, id: ResourceId) {
        self.id = Some(id);
    }

    fn is_new(&self) -> bool {
        self.new
    }

    fn parent(&self) -> Option<&ResourceId> {
        self.parent.as_ref()
    }
}

/// A cached resource type without a parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgUnit {
    pub id: Option<ResourceId>,
    pub name: String,
}

impl OrgUnit {
    pub fn existing(id: &str, name: &str) -> Self {
        OrgUnit {
            id: Some(ResourceId::new(id)),
            name: name.to_string(),
        }
    }
}

impl Resource for OrgUnit {
    const TYPE_NAME: &'static str = "OrgUnit";

    fn id(&self) -> Option<&ResourceId> {
        self.id.as_ref()
    }

    fn set_id(&mut self, id: ResourceId) {
        self.id = Some(id);
    }

    fn is_new(&self) -> bool {
        false
    }
}

/// A remote write issued by [`RecordingPersist`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistCall {
    Create(&'static str, Vec<ResourceId>),
    Update(&'static str, Vec<ResourceId>),
    Delete(&'static str, Vec<ResourceId>),
}

/// Persist callback recording every batch into a shared log, failing the
/// ids it was told to fail.
#[derive(Debug, Clone, Default)]
pub struct RecordingPersist {
    pub calls: Arc<Mutex<Vec<PersistCall>>>,
    pub failing: Arc<Mutex<Vec<ResourceId>>>,
}

impl RecordingPersist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<PersistCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn fail(&self, id: &str) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ResourceId::new(id));
    }

    fn results(&self, ids: &[ResourceId]) -> Vec<PersistResult> {
        let failing = self.failing.lock().unwrap_or_else(PoisonError::into_inner);
        ids.iter()
            .map(|id| {
                if failing.contains(id) {
                    PersistResult::failed(id.clone(), "rejected")
                } else {
                    PersistResult::ok(id.clone())
                }
            })
            .collect()
    }

    fn record(&self, call: PersistCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }
}

impl<T: Resource> PersistCallback<T> for RecordingPersist {
    async fn persist_save(&self, resources: Vec<T>, create: bool) -> Vec<PersistResult> {
        let ids: Vec<ResourceId> = resources.iter().filter_map(|r| r.id().cloned()).collect();
        self.record(if create {
            PersistCall::Create(T::TYPE_NAME, ids.clone())
        } else {
            PersistCall::Update(T::TYPE_NAME, ids.clone())
        });
        self.results(&ids)
    }

    async fn persist_delete(&self, ids: Vec<ResourceId>) -> Vec<PersistResult> {
        self.record(PersistCall::Delete(T::TYPE_NAME, ids.clone()));
        self.results(&ids)
    }
}
