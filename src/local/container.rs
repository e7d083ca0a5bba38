use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use tracing::debug;

use super::error::{LocalError, Result};
use super::persist::{FlushObserver, PersistCallback};
use super::repository::LocalResourceRepository;
use super::resource::Resource;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A repository together with the callback that flushes it.
struct RepositoryItem<T, P> {
    repository: LocalResourceRepository<T>,
    callback: P,
}

/// Type-erased [`RepositoryItem`].
trait Flush: Send + Sync {
    fn repository_mut(&mut self) -> &mut dyn Any;

    fn apply_saves<'a>(&'a self, observer: &'a mut dyn FlushObserver) -> BoxFuture<'a, ()>;

    fn apply_deletes<'a>(&'a self, observer: &'a mut dyn FlushObserver) -> BoxFuture<'a, ()>;
}

impl<T: Resource, P: PersistCallback<T>> Flush for RepositoryItem<T, P> {
    fn repository_mut(&mut self) -> &mut dyn Any {
        &mut self.repository
    }

    fn apply_saves<'a>(&'a self, observer: &'a mut dyn FlushObserver) -> BoxFuture<'a, ()> {
        Box::pin(self.repository.apply_saves(&self.callback, observer))
    }

    fn apply_deletes<'a>(&'a self, observer: &'a mut dyn FlushObserver) -> BoxFuture<'a, ()> {
        Box::pin(self.repository.apply_deletes(&self.callback, observer))
    }
}

/// One repository per supported resource type, for one scope.
///
/// Types are registered in dependency order: a type referenced by another
/// must come first. Saves are flushed in that order and deletes in reverse,
/// so the remote system never sees a reference to a missing resource.
#[derive(Default)]
pub struct LocalResourceContainer {
    order: Vec<TypeId>,
    items: HashMap<TypeId, Box<dyn Flush>>,
}

impl LocalResourceContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `T`, flushed through `callback`. Registering a type twice keeps
    /// its position and replaces the callback and cached contents.
    pub fn with_type<T: Resource, P: PersistCallback<T>>(mut self, callback: P) -> Self {
        let type_id = TypeId::of::<T>();
        if !self.items.contains_key(&type_id) {
            self.order.push(type_id);
        }
        self.items.insert(
            type_id,
            Box::new(RepositoryItem {
                repository: LocalResourceRepository::<T>::new(),
                callback,
            }),
        );
        self
    }

    pub fn supports<T: Resource>(&self) -> bool {
        self.items.contains_key(&TypeId::of::<T>())
    }

    pub fn repository<T: Resource>(&mut self) -> Result<&mut LocalResourceRepository<T>> {
        self.items
            .get_mut(&TypeId::of::<T>())
            .and_then(|item| item.repository_mut().downcast_mut())
            .ok_or(LocalError::UnsupportedResourceType(T::TYPE_NAME))
    }

    /// Flushes every repository: all saves in registration order, then all
    /// deletes in reverse order.
    pub async fn apply(&self, observer: &mut dyn FlushObserver) {
        debug!(types = self.order.len(), "Flushing local resources");
        for type_id in &self.order {
            if let Some(item) = self.items.get(type_id) {
                item.apply_saves(&mut *observer).await;
            }
        }
        for type_id in self.order.iter().rev() {
            if let Some(item) = self.items.get(type_id) {
                item.apply_deletes(&mut *observer).await;
            }
        }
    }
}
