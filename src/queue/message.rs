//! Broker message types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ChangeInfo, RequestId, ResourceId, SubscriptionResourceId};

/// Logical queue a message belongs to.
///
/// Each queue has its own lanes, so a subscription request that publishes
/// resource changes never waits on its own lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    SubscriptionRequests,
    ResourceChanges,
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueName::SubscriptionRequests => write!(f, "subscription_requests"),
            QueueName::ResourceChanges => write!(f, "resource_changes"),
        }
    }
}

/// "Poll this subscription resource."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub subscription_resource_id: SubscriptionResourceId,
    pub request_id: RequestId,
    pub received_at: DateTime<Utc>,
}

/// A remote resource that changed and has not been processed in this state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceChange {
    pub subscription_resource_id: SubscriptionResourceId,
    pub resource_id: ResourceId,
    pub version: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,

    /// Processing run that enqueued the change.
    pub request_id: RequestId,
}

impl ResourceChange {
    pub fn new(
        subscription_resource_id: SubscriptionResourceId,
        change: ChangeInfo,
        request_id: RequestId,
    ) -> Self {
        ResourceChange {
            subscription_resource_id,
            resource_id: change.id,
            version: change.version,
            last_updated: change.last_updated,
            request_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueMessage {
    SubscriptionRequest(SubscriptionRequest),
    ResourceChange(ResourceChange),
}

impl QueueMessage {
    pub fn queue(&self) -> QueueName {
        match self {
            QueueMessage::SubscriptionRequest(_) => QueueName::SubscriptionRequests,
            QueueMessage::ResourceChange(_) => QueueName::ResourceChanges,
        }
    }

    /// Messages with the same grouping key are delivered in order, one at a
    /// time.
    pub fn grouping_key(&self) -> &SubscriptionResourceId {
        match self {
            QueueMessage::SubscriptionRequest(r) => &r.subscription_resource_id,
            QueueMessage::ResourceChange(c) => &c.subscription_resource_id,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        match self {
            QueueMessage::SubscriptionRequest(r) => &r.request_id,
            QueueMessage::ResourceChange(c) => &c.request_id,
        }
    }
}
