//! Local persistence of the synchronization bookkeeping.
//!
//! Three kinds of state must survive between poll cycles:
//! - **Watermarks**: the last completed poll cycle per subscription resource
//! - **Processed fingerprints**: which remote resource states were already
//!   enqueued, pruned by age
//! - **Queued markers**: whether a subscription request or a remote resource
//!   is currently waiting on the broker
//!
//! # File Layout
//!
//! ```text
//! <state_dir>/
//!   sync_state.json   # full snapshot, rewritten atomically on every change
//! ```
//!
//! # Crash Safety
//!
//! Snapshots are written with write-temp, fsync, rename, fsync(dir). A crash
//! leaves either the previous or the new snapshot on disk. Combined with the
//! under-advancing watermark this yields at-least-once processing.

pub mod file;
pub mod memory;
pub mod snapshot;
pub mod state;
pub mod store;

pub use file::{FileStore, STATE_FILE_NAME};
pub use memory::MemoryStore;
pub use snapshot::{SCHEMA_VERSION, SyncSnapshot, load_snapshot, save_snapshot_atomic, try_load_snapshot};
pub use state::{QueuedEntry, SyncState};
pub use store::{
    BatchStore, ChangeMark, EnqueueOutcome, MarkOutcome, ProcessedStore, QueueStore,
    QueuedResource, Result, StoreError, SyncStore, WatermarkStore, undo_set,
};
