//! Storage strategies
//!
//! A [`Storage`] binds one resolved location to exactly one live snapshot,
//! lazily loaded on first access and replaced wholesale whenever the
//! location's content changes (commit or external edit). Two strategies
//! exist: file-based (`file`), where the snapshot is one document, and
//! directory-based (`directory`), where a splitter spreads the snapshot over
//! one file per sub-state.

pub mod directory;
pub mod file;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::data::StorageData;
use crate::element::StateElement;
use crate::error::{StoreError, StoreResult};

pub use directory::{DirectoryStorage, NamedChildSplitter, StateSplitter};
pub use file::FileStorage;

/// A file that could not be written because it is read-only
///
/// Carries enough identity for the caller to make the file writable and
/// retry the save cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadonlyFile {
    /// The unwritable file
    pub path: PathBuf,
    /// Cache key of the owning storage
    pub storage_key: String,
}

/// Result of committing one storage's pending snapshot
///
/// Read-only and failure conditions are ordinary variants, not thrown
/// signals; the caller decides how to aggregate them.
#[derive(Debug)]
pub enum CommitOutcome {
    /// Durable content was updated
    Committed,
    /// Nothing to write: content was already identical, or saving is
    /// disabled on this storage
    Skipped,
    /// The backing file is not writable; retry after making it writable
    ReadOnly(ReadonlyFile),
    /// A non-recoverable failure; reported in the save cycle's aggregate
    Failed(StoreError),
}

/// One physical storage location with its live snapshot
pub trait Storage: Send + Sync {
    /// Cache key (the macro-expanded path)
    fn key(&self) -> &str;

    /// Backing file or directory
    fn path(&self) -> &Path;

    /// The current snapshot, loading it on first access
    fn snapshot(&self) -> StoreResult<Arc<StorageData>>;

    /// Whether this storage currently accepts save sessions
    fn save_enabled(&self) -> bool;

    /// Toggle saving; immediately visible across threads
    fn set_save_enabled(&self, enabled: bool);

    /// Replace the published snapshot
    fn publish(&self, snapshot: StorageData);

    /// Write a pending snapshot to durable media without publishing it
    fn write_pending(&self, pending: &StorageData) -> CommitOutcome;

    /// Recompute the snapshot from disk after an external change, publish
    /// it, and report which component names differ
    ///
    /// `None` means the old and new content are incomparable (no previous
    /// snapshot, or a different format version); the caller must treat every
    /// component of this storage as changed.
    fn analyze_external_change(&self) -> StoreResult<Option<BTreeSet<String>>>;

    /// Stored state of one component, cloned out of the snapshot
    fn state(&self, component: &str) -> StoreResult<Option<StateElement>> {
        Ok(self
            .snapshot()?
            .get(component)
            .map(|s| s.element().clone()))
    }
}

/// Shared lazy snapshot slot used by both strategies
pub(crate) struct SnapshotCell {
    slot: RwLock<Option<Arc<StorageData>>>,
}

impl SnapshotCell {
    pub(crate) fn new() -> Self {
        SnapshotCell {
            slot: RwLock::new(None),
        }
    }

    pub(crate) fn current(&self) -> Option<Arc<StorageData>> {
        self.slot.read().clone()
    }

    pub(crate) fn get_or_load(
        &self,
        load: impl FnOnce() -> StoreResult<StorageData>,
    ) -> StoreResult<Arc<StorageData>> {
        if let Some(snapshot) = self.slot.read().clone() {
            return Ok(snapshot);
        }
        let mut slot = self.slot.write();
        if let Some(snapshot) = slot.clone() {
            return Ok(snapshot);
        }
        let snapshot = Arc::new(load()?);
        *slot = Some(snapshot.clone());
        Ok(snapshot)
    }

    pub(crate) fn publish(&self, snapshot: StorageData) {
        *self.slot.write() = Some(Arc::new(snapshot));
    }
}

/// Whether an IO error means the target is read-only rather than broken
pub(crate) fn is_readonly_error(error: &std::io::Error) -> bool {
    error.kind() == std::io::ErrorKind::PermissionDenied
}

/// Metadata check used before attempting a write
pub(crate) fn path_is_readonly(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.permissions().readonly())
        .unwrap_or(false)
}

/// Content identity modulo an optional BOM prologue and trailing line
/// separators
pub(crate) fn content_identical(on_disk: &[u8], rendered: &[u8]) -> bool {
    fn normalize(bytes: &[u8]) -> &[u8] {
        let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF][..]).unwrap_or(bytes);
        let mut end = bytes.len();
        while end > 0 && (bytes[end - 1] == b'\n' || bytes[end - 1] == b'\r') {
            end -= 1;
        }
        &bytes[..end]
    }
    normalize(on_disk) == normalize(rendered)
}
