//! Subscription resources and the registry that holds them.
//!
//! The registry is built once at startup and shared by `Arc` with the
//! processor, the scheduler and the webhook endpoint.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ids::{SubscriptionId, SubscriptionResourceId};

/// A watched (remote system, resource type, filter) tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionResource {
    pub id: SubscriptionResourceId,

    /// The remote subscription this resource belongs to.
    pub subscription_id: SubscriptionId,

    /// Remote resource type name (e.g. `Patient`).
    pub resource_type: String,

    /// Caller criteria as a query string, e.g. `?status=final`.
    #[serde(default)]
    pub criteria: Option<String>,

    /// Clock-skew tolerance subtracted from the watermark. Falls back to
    /// [`crate::poll::PollConfig::tolerance`] when unset.
    #[serde(default)]
    pub tolerance: Option<Duration>,

    /// Expected value of the webhook `Authorization` header, if any.
    #[serde(default)]
    pub web_hook_authorization: Option<String>,
}

impl SubscriptionResource {
    pub fn new(
        id: impl Into<String>,
        subscription_id: impl Into<String>,
        resource_type: impl Into<String>,
    ) -> Self {
        SubscriptionResource {
            id: SubscriptionResourceId::new(id),
            subscription_id: SubscriptionId::new(subscription_id),
            resource_type: resource_type.into(),
            criteria: None,
            tolerance: None,
            web_hook_authorization: None,
        }
    }

    pub fn with_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.criteria = Some(criteria.into());
        self
    }

    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = Some(tolerance);
        self
    }

    pub fn with_web_hook_authorization(mut self, value: impl Into<String>) -> Self {
        self.web_hook_authorization = Some(value.into());
        self
    }
}

/// Registry of all configured subscription resources.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    resources: RwLock<BTreeMap<SubscriptionResourceId, SubscriptionResource>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from a fixed set of subscription resources.
    pub fn from_resources(resources: impl IntoIterator<Item = SubscriptionResource>) -> Self {
        let registry = Self::new();
        for resource in resources {
            registry.register(resource);
        }
        registry
    }

    /// Adds or replaces a subscription resource.
    pub fn register(&self, resource: SubscriptionResource) {
        self.resources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(resource.id.clone(), resource);
    }

    /// Removes a subscription resource. Pending notifications for it are
    /// skipped when they are consumed.
    pub fn remove(&self, id: &SubscriptionResourceId) -> Option<SubscriptionResource> {
        self.resources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    pub fn get(&self, id: &SubscriptionResourceId) -> Option<SubscriptionResource> {
        self.resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Returns all registered ids in stable order.
    pub fn ids(&self) -> Vec<SubscriptionResourceId> {
        self.resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
