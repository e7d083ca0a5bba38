//! Cached resources and their lifecycle within one scope.
//!
//! ```text
//!            save (new)                 delete
//!   ∅ ──────────────────► SavedNew ◄──────────────► DeletedNew
//!                              ▲          save
//!            save (existing)   │
//!   ∅ ──────────────────► SavedExisting ──┐
//!                              ▲          │ delete
//!            save              │          ▼
//!   Found ─────────────────────┘    DeletedExisting   (terminal)
//!     └───────────── delete ──────────────▲
//! ```
//!
//! `New` states were created locally and have never existed remotely, so
//! deleting them only drops the pending create. `Existing` states exist
//! remotely and need a remote update or delete on flush.

use serde::{Deserialize, Serialize};

use crate::types::ResourceId;

/// A resource type that can be cached locally.
pub trait Resource: Clone + Send + Sync + 'static {
    /// Name used in errors and logs.
    const TYPE_NAME: &'static str;

    /// Whether [`Resource::parent`] is meaningful for this type.
    const HAS_PARENT: bool = false;

    fn id(&self) -> Option<&ResourceId>;

    fn set_id(&mut self, id: ResourceId);

    /// True when the resource has not been created remotely yet.
    fn is_new(&self) -> bool;

    /// The owning resource. Must not change once cached.
    fn parent(&self) -> Option<&ResourceId> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LocalResourceState {
    /// Read from the remote system and not modified.
    Found,
    SavedNew,
    SavedExisting,
    DeletedNew,
    DeletedExisting,
}

impl LocalResourceState {
    pub fn is_deleted(self) -> bool {
        matches!(
            self,
            LocalResourceState::DeletedNew | LocalResourceState::DeletedExisting
        )
    }

    /// Created locally, never existed remotely.
    pub fn is_new(self) -> bool {
        matches!(self, LocalResourceState::SavedNew | LocalResourceState::DeletedNew)
    }

    /// State after saving an already cached entry. `None` for
    /// `DeletedExisting`, which is terminal within a scope.
    pub fn on_save(self) -> Option<Self> {
        match self {
            LocalResourceState::SavedNew | LocalResourceState::DeletedNew => {
                Some(LocalResourceState::SavedNew)
            }
            LocalResourceState::Found | LocalResourceState::SavedExisting => {
                Some(LocalResourceState::SavedExisting)
            }
            LocalResourceState::DeletedExisting => None,
        }
    }

    pub fn on_delete(self) -> Self {
        if self.is_new() {
            LocalResourceState::DeletedNew
        } else {
            LocalResourceState::DeletedExisting
        }
    }
}
