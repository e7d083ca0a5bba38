//! Incremental discovery of changed remote resources.
//!
//! The remote server's paging is only partially conformant: next-page
//! cursors may be missing, total counts may be missing, and timestamps may be
//! missing. The poller follows cursors when present, continues by value
//! (restarting at the latest seen timestamp) when not, and fails with a
//! stall error instead of looping when the server stops advancing.

pub mod config;
pub mod criteria;
pub mod error;
pub mod poller;
pub mod source;

pub use config::PollConfig;
pub use criteria::{CriteriaError, POLLER_OWNED_PARAMETERS, parse_criteria};
pub use error::PollError;
pub use poller::{ChangeConsumer, ChangePoller, PollOutcome};
pub use source::{ChangeSource, PageCursor, SearchPage, SearchQuery};
