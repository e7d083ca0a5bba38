//! Local resource cache for one unit of work.
//!
//! Transforming a remote change usually reads and writes several related
//! local resources. Instead of writing each one through immediately, the
//! transformation works against a [`LocalResourceContainer`]: reads are
//! answered from the cache once a query has been materialized, writes are
//! recorded with a lifecycle state, and everything is flushed in one pass at
//! the end of the scope.
//!
//! Flushing is partial: each item reports its own outcome to the
//! [`FlushObserver`] and succeeded items are not rolled back when others
//! fail.

pub mod container;
pub mod error;
pub mod key;
pub mod persist;
pub mod repository;
pub mod resource;

pub use container::LocalResourceContainer;
pub use error::LocalError;
pub use key::CollectionKey;
pub use persist::{FlushObserver, PersistCallback, PersistResult, PersistStatus, Persisted};
pub use repository::LocalResourceRepository;
pub use resource::{LocalResourceState, Resource};
