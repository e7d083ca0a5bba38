//! Per-type local cache of resources within one scope.

use std::collections::{HashMap, HashSet};
use std::future::Future;

use tracing::{debug, info, warn};

use super::error::{LocalError, Result};
use super::key::CollectionKey;
use super::persist::{FlushObserver, PersistCallback, PersistResult, Persisted};
use super::resource::{LocalResourceState, Resource};
use crate::types::{ResourceId, ResourceKey};

#[derive(Debug, Clone)]
struct LocalEntry<T> {
    resource: T,
    key: Option<ResourceKey>,
    state: LocalResourceState,
}

/// Cached resources of type `T`, keyed by id.
///
/// Not synchronized: one repository belongs to one request or one
/// unit of work and is dropped with it.
#[derive(Debug, Clone)]
pub struct LocalResourceRepository<T> {
    entries: HashMap<ResourceId, LocalEntry<T>>,
    /// Insertion order of `entries`; results and flush batches follow it.
    order: Vec<ResourceId>,
    collection_keys: HashSet<CollectionKey>,
}

impl<T> Default for LocalResourceRepository<T> {
    fn default() -> Self {
        LocalResourceRepository {
            entries: HashMap::new(),
            order: Vec::new(),
            collection_keys: HashSet::new(),
        }
    }
}

impl<T: Resource> LocalResourceRepository<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn state(&self, id: &ResourceId) -> Option<LocalResourceState> {
        self.entries.get(id).map(|e| e.state)
    }

    /// Saves `resource` locally, minting an id when it has none.
    ///
    /// `key` correlates the eventual flush result with the caller's input;
    /// a later save without a key keeps the earlier one.
    pub fn save(&mut self, mut resource: T, key: Option<ResourceKey>) -> Result<&T> {
        let new = resource.is_new() || resource.id().is_none();
        let id = match resource.id() {
            Some(id) => id.clone(),
            None => {
                let id = ResourceId::new(uuid::Uuid::new_v4().simple().to_string());
                resource.set_id(id.clone());
                id
            }
        };

        match self.entries.get_mut(&id) {
            None => {
                let state = if new {
                    LocalResourceState::SavedNew
                } else {
                    LocalResourceState::SavedExisting
                };
                debug!(resource_type = T::TYPE_NAME, %id, ?state, "Cached saved resource");
                self.insert(id.clone(), LocalEntry {
                    resource,
                    key,
                    state,
                });
            }
            Some(entry) => {
                if T::HAS_PARENT && entry.resource.parent() != resource.parent() {
                    return Err(LocalError::CorrelationMismatch {
                        resource_type: T::TYPE_NAME,
                        id,
                        cached: entry.resource.parent().cloned(),
                        given: resource.parent().cloned(),
                    });
                }
                let Some(state) = entry.state.on_save() else {
                    return Err(LocalError::Deleted {
                        resource_type: T::TYPE_NAME,
                        id,
                    });
                };
                debug!(resource_type = T::TYPE_NAME, %id, from = ?entry.state, to = ?state, "Updated cached resource");
                entry.resource = resource;
                entry.state = state;
                if key.is_some() {
                    entry.key = key;
                }
            }
        }

        Ok(&self.entries[&id].resource)
    }

    /// Marks `id` deleted. An id that is not cached is materialized with
    /// `placeholder` first and treated as existing remotely.
    pub fn delete_by_id(
        &mut self,
        id: &ResourceId,
        key: Option<ResourceKey>,
        placeholder: impl FnOnce(&ResourceId) -> T,
    ) {
        if !self.entries.contains_key(id) {
            self.insert(id.clone(), LocalEntry {
                resource: placeholder(id),
                key: None,
                state: LocalResourceState::Found,
            });
        }
        if let Some(entry) = self.entries.get_mut(id) {
            let state = entry.state.on_delete();
            debug!(resource_type = T::TYPE_NAME, %id, from = ?entry.state, to = ?state, "Deleted cached resource");
            entry.state = state;
            if key.is_some() {
                entry.key = key;
            }
        }
    }

    pub fn contains_collection_key(&self, key: &CollectionKey) -> bool {
        self.collection_keys.contains(key)
    }

    /// Registers `resources` fetched remotely as the complete result of
    /// `key`.
    ///
    /// Resources already cached are not replaced: the cached (possibly
    /// locally modified) version is returned instead. Deleted entries are
    /// left out of the result.
    pub fn found(&mut self, resources: Vec<T>, key: CollectionKey) -> Result<Vec<T>> {
        let mut result = Vec::with_capacity(resources.len());
        for resource in resources {
            let Some(id) = resource.id().cloned() else {
                return Err(LocalError::MissingId {
                    resource_type: T::TYPE_NAME,
                });
            };
            match self.entries.get(&id) {
                Some(entry) if entry.state.is_deleted() => {}
                Some(entry) => result.push(entry.resource.clone()),
                None => {
                    result.push(resource.clone());
                    self.insert(id, LocalEntry {
                        resource,
                        key: None,
                        state: LocalResourceState::Found,
                    });
                }
            }
        }
        self.collection_keys.insert(key);
        Ok(result)
    }

    pub fn find_one_by_id(&self, id: &ResourceId) -> Option<&T> {
        self.entries
            .get(id)
            .filter(|e| !e.state.is_deleted())
            .map(|e| &e.resource)
    }

    pub fn find(&self, filter: impl Fn(&T) -> bool) -> Vec<&T> {
        self.live().filter(|r| filter(*r)).collect()
    }

    /// Like [`Self::find`], restricted to resources owned by `parent`.
    pub fn find_by_parent(
        &self,
        parent: &ResourceId,
        filter: impl Fn(&T) -> bool,
    ) -> Result<Vec<&T>> {
        if !T::HAS_PARENT {
            return Err(LocalError::CorrelationUnsupported {
                resource_type: T::TYPE_NAME,
            });
        }
        Ok(self
            .live()
            .filter(|r| r.parent() == Some(parent) && filter(*r))
            .collect())
    }

    /// Answers a query locally once its result has been materialized under
    /// `key`; otherwise calls `fetch`, registers the fetched resources with
    /// [`Self::found`] and returns those matching `filter`.
    pub async fn find_or_fetch<F, Fut, E>(
        &mut self,
        key: CollectionKey,
        parent: Option<&ResourceId>,
        filter: impl Fn(&T) -> bool,
        fetch: F,
    ) -> std::result::Result<Vec<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Vec<T>, E>>,
        E: From<LocalError>,
    {
        if parent.is_some() && !T::HAS_PARENT {
            return Err(LocalError::CorrelationUnsupported {
                resource_type: T::TYPE_NAME,
            }
            .into());
        }

        if self.contains_collection_key(&key) {
            debug!(resource_type = T::TYPE_NAME, key = ?key.as_str(), "Answering query locally");
            let local = match parent {
                Some(parent) => self.find_by_parent(parent, &filter)?,
                None => self.find(&filter),
            };
            return Ok(local.into_iter().cloned().collect());
        }

        let fetched = fetch().await?;
        let found = self.found(fetched, key)?;
        Ok(found
            .into_iter()
            .filter(|r| parent.is_none_or(|p| r.parent() == Some(p)) && filter(r))
            .collect())
    }

    /// Flushes pending saves: creates first, then updates.
    pub async fn apply_saves<P, O>(&self, callback: &P, observer: &mut O)
    where
        P: PersistCallback<T>,
        O: FlushObserver + ?Sized,
    {
        for (state, create) in [
            (LocalResourceState::SavedNew, true),
            (LocalResourceState::SavedExisting, false),
        ] {
            let ids = self.ids_in_state(state);
            if ids.is_empty() {
                continue;
            }
            let resources = ids
                .iter()
                .map(|id| self.entries[id].resource.clone())
                .collect();
            info!(resource_type = T::TYPE_NAME, count = ids.len(), create, "Flushing saves");
            let results = callback.persist_save(resources, create).await;
            self.report(&ids, results, observer);
        }
    }

    /// Flushes remote deletes. Entries deleted before ever being created
    /// remotely are skipped.
    pub async fn apply_deletes<P, O>(&self, callback: &P, observer: &mut O)
    where
        P: PersistCallback<T>,
        O: FlushObserver + ?Sized,
    {
        let ids = self.ids_in_state(LocalResourceState::DeletedExisting);
        if ids.is_empty() {
            return;
        }
        info!(resource_type = T::TYPE_NAME, count = ids.len(), "Flushing deletes");
        let results = callback.persist_delete(ids.clone()).await;
        self.report(&ids, results, observer);
    }

    fn insert(&mut self, id: ResourceId, entry: LocalEntry<T>) {
        self.order.push(id.clone());
        self.entries.insert(id, entry);
    }

    fn live(&self) -> impl Iterator<Item = &T> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .filter(|e| !e.state.is_deleted())
            .map(|e| &e.resource)
    }

    fn ids_in_state(&self, state: LocalResourceState) -> Vec<ResourceId> {
        self.order
            .iter()
            .filter(|id| self.entries.get(*id).is_some_and(|e| e.state == state))
            .cloned()
            .collect()
    }

    fn report<O: FlushObserver + ?Sized>(
        &self,
        requested: &[ResourceId],
        results: Vec<PersistResult>,
        observer: &mut O,
    ) {
        for result in &results {
            let entry = requested
                .contains(&result.resource_id)
                .then(|| self.entries.get(&result.resource_id))
                .flatten();
            let Some(entry) = entry else {
                warn!(
                    resource_type = T::TYPE_NAME,
                    resource_id = %result.resource_id,
                    "Persist result for a resource that was not flushed"
                );
                continue;
            };
            if !result.is_ok() {
                warn!(
                    resource_type = T::TYPE_NAME,
                    resource_id = %result.resource_id,
                    status = ?result.status,
                    "Flushing resource failed"
                );
            }
            observer.persisted(Persisted {
                resource_type: T::TYPE_NAME,
                resource: &entry.resource,
                resource_key: entry.key.as_ref(),
                result,
            });
        }
    }
}

#[cfg(test)]
#[path = "repository_tests.rs"]
mod tests;
