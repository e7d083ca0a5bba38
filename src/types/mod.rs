//! Core domain types for the synchronization core.
//!
//! This module contains the identifiers, change notifications, watermarks and
//! subscription configuration shared by the poller, the tracker, the
//! dispatcher and the HTTP layer.

pub mod change;
pub mod ids;
pub mod subscription;

// Re-export commonly used types at the module level
pub use change::{ChangeInfo, Watermark};
pub use ids::{RequestId, ResourceId, ResourceKey, SubscriptionId, SubscriptionResourceId};
pub use subscription::{SubscriptionRegistry, SubscriptionResource};
