//! On-disk snapshot of the synchronization state.
//!
//! One JSON document per state directory, replaced as a whole on every
//! change: the new content goes to `<name>.json.tmp`, is synced, renamed
//! over the old file, and the directory is synced. A reader never observes
//! a half-written snapshot.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::SyncState;
use super::store::{Result, StoreError};

/// Bumped on incompatible changes to [`SyncState`]'s serialized form.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub schema_version: u32,

    /// When this snapshot was written.
    pub snapshot_at: DateTime<Utc>,

    pub state: SyncState,
}

impl SyncSnapshot {
    pub fn new(state: SyncState) -> Self {
        SyncSnapshot {
            schema_version: SCHEMA_VERSION,
            snapshot_at: Utc::now(),
            state,
        }
    }

    fn check_schema(&self) -> Result<()> {
        if self.schema_version == SCHEMA_VERSION {
            return Ok(());
        }
        Err(StoreError::SchemaMismatch {
            expected: SCHEMA_VERSION,
            got: self.schema_version,
        })
    }
}

/// Writes `snapshot` to `path` so that a crash leaves either the previous
/// file or the complete new one. The parent directory is created on demand.
pub fn save_snapshot_atomic(path: &Path, snapshot: &SyncSnapshot) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(snapshot)?;
    let dir = path.parent().filter(|d| !d.as_os_str().is_empty());
    if let Some(dir) = dir {
        std::fs::create_dir_all(dir)?;
    }

    let tmp_path = path.with_extension("json.tmp");
    if let Err(e) = write_synced(&tmp_path, &bytes) {
        // Best effort; a stale temp file is overwritten by the next save.
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    std::fs::rename(&tmp_path, path)?;

    // The rename lives in the directory entry.
    if let Some(dir) = dir {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Reads the snapshot at `path`, rejecting other schema versions.
pub fn load_snapshot(path: &Path) -> Result<SyncSnapshot> {
    let snapshot: SyncSnapshot = serde_json::from_slice(&std::fs::read(path)?)?;
    snapshot.check_schema()?;
    Ok(snapshot)
}

/// [`load_snapshot`], with `None` for a file that does not exist yet.
pub fn try_load_snapshot(path: &Path) -> Result<Option<SyncSnapshot>> {
    match load_snapshot(path) {
        Err(StoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        other => other.map(Some),
    }
}
