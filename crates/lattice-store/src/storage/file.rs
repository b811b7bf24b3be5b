//! File-based storage: the whole snapshot is one document

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::data::StorageData;
use crate::document::{DocumentCodec, DocumentFormat, CURRENT_FORMAT_VERSION};
use crate::error::{IoOperation, StoreError, StoreResult};
use crate::macros::PathMacros;
use crate::storage::{
    content_identical, is_readonly_error, path_is_readonly, CommitOutcome, ReadonlyFile,
    SnapshotCell, Storage,
};

/// Storage for a single document file
///
/// The snapshot is loaded lazily and cached; a save cycle hands a pending
/// snapshot to [`Storage::write_pending`] and publishes it on success. A
/// critical storage that fails to parse blocks further writes until its
/// content is corrected, instead of silently recreating the file.
pub struct FileStorage {
    key: String,
    path: PathBuf,
    format: DocumentFormat,
    codec: Arc<DocumentCodec>,
    macros: Arc<PathMacros>,
    snapshot: SnapshotCell,
    save_enabled: AtomicBool,
    critical: bool,
    blocked: AtomicBool,
}

impl FileStorage {
    pub(crate) fn new(
        key: String,
        path: PathBuf,
        format: DocumentFormat,
        codec: Arc<DocumentCodec>,
        macros: Arc<PathMacros>,
        critical: bool,
    ) -> Self {
        FileStorage {
            key,
            path,
            format,
            codec,
            macros,
            snapshot: SnapshotCell::new(),
            save_enabled: AtomicBool::new(true),
            critical,
            blocked: AtomicBool::new(false),
        }
    }

    fn load(&self) -> StoreResult<StorageData> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no backing file, starting empty");
                return Ok(StorageData::new(CURRENT_FORMAT_VERSION));
            }
            Err(e) => return Err(StoreError::io(self.path.clone(), IoOperation::Read, e)),
        };

        match self.codec.parse(&bytes, self.format, &self.path) {
            Ok(parsed) => {
                self.blocked.store(false, Ordering::SeqCst);
                Ok(self.expand_paths(parsed))
            }
            Err(e) if self.critical => {
                // block writes until the user corrects the file
                self.blocked.store(true, Ordering::SeqCst);
                error!(
                    path = %self.path.display(),
                    error = %e,
                    "critical storage is corrupt; saving blocked until corrected"
                );
                Ok(StorageData::new(CURRENT_FORMAT_VERSION))
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "corrupt storage treated as empty; content will be recreated on save"
                );
                Ok(StorageData::new(CURRENT_FORMAT_VERSION))
            }
        }
    }

    fn expand_paths(&self, parsed: StorageData) -> StorageData {
        let mut expanded = StorageData::new(parsed.version());
        for (name, state) in parsed.iter() {
            let mut element = state.element().clone();
            self.macros.expand_element(name, &mut element);
            expanded.set_state(name, element);
        }
        expanded
    }

    fn collapse_paths(&self, pending: &StorageData) -> StorageData {
        let mut collapsed = StorageData::new(pending.version());
        for (name, state) in pending.iter() {
            let mut element = state.element().clone();
            self.macros.collapse_element(&mut element);
            collapsed.set_state(name, element);
        }
        collapsed
    }

    fn delete_file(&self) -> CommitOutcome {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "deleted empty storage file");
                CommitOutcome::Committed
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CommitOutcome::Skipped,
            Err(e) if is_readonly_error(&e) => CommitOutcome::ReadOnly(ReadonlyFile {
                path: self.path.clone(),
                storage_key: self.key.clone(),
            }),
            Err(e) => CommitOutcome::Failed(StoreError::io(
                self.path.clone(),
                IoOperation::Delete,
                e,
            )),
        }
    }

    fn write_file(&self, bytes: &[u8]) -> CommitOutcome {
        if path_is_readonly(&self.path) {
            return CommitOutcome::ReadOnly(ReadonlyFile {
                path: self.path.clone(),
                storage_key: self.key.clone(),
            });
        }
        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                if let Err(e) = fs::create_dir_all(parent) {
                    return CommitOutcome::Failed(StoreError::io(
                        parent.to_path_buf(),
                        IoOperation::CreateDir,
                        e,
                    ));
                }
            }
        }
        match fs::write(&self.path, bytes) {
            Ok(()) => {
                debug!(path = %self.path.display(), bytes = bytes.len(), "storage written");
                CommitOutcome::Committed
            }
            Err(e) if is_readonly_error(&e) => CommitOutcome::ReadOnly(ReadonlyFile {
                path: self.path.clone(),
                storage_key: self.key.clone(),
            }),
            Err(e) => {
                CommitOutcome::Failed(StoreError::io(self.path.clone(), IoOperation::Write, e))
            }
        }
    }
}

impl Storage for FileStorage {
    fn key(&self) -> &str {
        &self.key
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn snapshot(&self) -> StoreResult<Arc<StorageData>> {
        self.snapshot.get_or_load(|| self.load())
    }

    fn save_enabled(&self) -> bool {
        self.save_enabled.load(Ordering::SeqCst)
    }

    fn set_save_enabled(&self, enabled: bool) {
        self.save_enabled.store(enabled, Ordering::SeqCst);
    }

    fn publish(&self, snapshot: StorageData) {
        self.snapshot.publish(snapshot);
    }

    fn write_pending(&self, pending: &StorageData) -> CommitOutcome {
        if self.blocked.load(Ordering::SeqCst) {
            return CommitOutcome::Failed(StoreError::TruncatedCritical {
                path: self.path.clone(),
            });
        }

        let collapsed = self.collapse_paths(pending);
        if collapsed.is_empty() {
            return self.delete_file();
        }

        let bytes = match self.codec.render(&collapsed, self.format) {
            Ok(bytes) => bytes,
            Err(e) => return CommitOutcome::Failed(e),
        };
        if let Ok(on_disk) = fs::read(&self.path) {
            if content_identical(&on_disk, &bytes) {
                debug!(path = %self.path.display(), "content unchanged, skipping write");
                return CommitOutcome::Skipped;
            }
        }
        self.write_file(&bytes)
    }

    fn analyze_external_change(&self) -> StoreResult<Option<BTreeSet<String>>> {
        let old = self.snapshot.current();
        let new = self.load()?;
        let changed = old.as_deref().and_then(|old| old.diff(&new));
        self.snapshot.publish(new);
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::StateElement;
    use crate::macros::MacroTable;
    use tempfile::TempDir;

    fn make_storage(dir: &TempDir, name: &str, critical: bool) -> FileStorage {
        let path = dir.path().join(name);
        FileStorage::new(
            path.to_string_lossy().into_owned(),
            path,
            DocumentFormat::Json,
            Arc::new(DocumentCodec::new("project")),
            Arc::new(PathMacros::new(MacroTable::new())),
            critical,
        )
    }

    fn state(value: &str) -> StateElement {
        StateElement::new("state").with_attribute("value", value)
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = TempDir::new().expect("temp dir");
        let storage = make_storage(&dir, "settings.json", false);

        let snapshot = storage.snapshot().expect("load");
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_commit_then_reload() {
        let dir = TempDir::new().expect("temp dir");
        let storage = make_storage(&dir, "settings.json", false);

        let mut pending = StorageData::new(CURRENT_FORMAT_VERSION);
        pending.set_state("editor", state("one"));
        assert!(matches!(
            storage.write_pending(&pending),
            CommitOutcome::Committed
        ));
        storage.publish(pending);

        let fresh = make_storage(&dir, "settings.json", false);
        assert_eq!(
            fresh.state("editor").expect("read"),
            Some(state("one"))
        );
    }

    #[test]
    fn test_identical_content_skips_write() {
        let dir = TempDir::new().expect("temp dir");
        let storage = make_storage(&dir, "settings.json", false);

        let mut pending = StorageData::new(CURRENT_FORMAT_VERSION);
        pending.set_state("editor", state("one"));
        assert!(matches!(
            storage.write_pending(&pending),
            CommitOutcome::Committed
        ));
        assert!(matches!(
            storage.write_pending(&pending),
            CommitOutcome::Skipped
        ));
    }

    #[test]
    fn test_empty_snapshot_deletes_file() {
        let dir = TempDir::new().expect("temp dir");
        let storage = make_storage(&dir, "settings.json", false);

        let mut pending = StorageData::new(CURRENT_FORMAT_VERSION);
        pending.set_state("editor", state("one"));
        storage.write_pending(&pending);
        assert!(storage.path().exists());

        let empty = StorageData::new(CURRENT_FORMAT_VERSION);
        assert!(matches!(
            storage.write_pending(&empty),
            CommitOutcome::Committed
        ));
        assert!(!storage.path().exists());
    }

    #[test]
    fn test_readonly_file_is_reported_not_fatal() {
        let dir = TempDir::new().expect("temp dir");
        let storage = make_storage(&dir, "settings.json", false);

        let mut pending = StorageData::new(CURRENT_FORMAT_VERSION);
        pending.set_state("editor", state("one"));
        storage.write_pending(&pending);

        let mut perms = fs::metadata(storage.path()).expect("meta").permissions();
        perms.set_readonly(true);
        fs::set_permissions(storage.path(), perms).expect("set perms");

        pending.set_state("editor", state("two"));
        match storage.write_pending(&pending) {
            CommitOutcome::ReadOnly(file) => assert_eq!(file.path, storage.path()),
            other => panic!("expected read-only outcome, got {other:?}"),
        }

        let mut perms = fs::metadata(storage.path()).expect("meta").permissions();
        perms.set_readonly(false);
        fs::set_permissions(storage.path(), perms).expect("restore perms");
    }

    #[test]
    fn test_corrupt_ordinary_storage_falls_back_to_empty() {
        let dir = TempDir::new().expect("temp dir");
        fs::write(dir.path().join("settings.json"), b"{ not json").expect("write");
        let storage = make_storage(&dir, "settings.json", false);

        let snapshot = storage.snapshot().expect("load");
        assert!(snapshot.is_empty());
        assert!(!matches!(
            storage.write_pending(&StorageData::new(CURRENT_FORMAT_VERSION).with_state("e", state("x"))),
            CommitOutcome::Failed(_)
        ));
    }

    #[test]
    fn test_corrupt_critical_storage_blocks_writes() {
        let dir = TempDir::new().expect("temp dir");
        fs::write(dir.path().join("critical.json"), b"{ not json").expect("write");
        let storage = make_storage(&dir, "critical.json", true);

        let snapshot = storage.snapshot().expect("load");
        assert!(snapshot.is_empty());

        let mut pending = StorageData::new(CURRENT_FORMAT_VERSION);
        pending.set_state("editor", state("one"));
        assert!(matches!(
            storage.write_pending(&pending),
            CommitOutcome::Failed(StoreError::TruncatedCritical { .. })
        ));

        // correcting the file unblocks on the next external-change analysis
        fs::write(dir.path().join("critical.json"), b"{\"project\": {}}").expect("write");
        storage.analyze_external_change().expect("analyze");
        assert!(matches!(
            storage.write_pending(&pending),
            CommitOutcome::Committed
        ));
    }

    #[test]
    fn test_external_change_analysis_reports_diff() {
        let dir = TempDir::new().expect("temp dir");
        let storage = make_storage(&dir, "settings.json", false);

        let mut pending = StorageData::new(CURRENT_FORMAT_VERSION);
        pending.set_state("editor", state("one"));
        pending.set_state("vcs", state("v"));
        storage.write_pending(&pending);
        storage.publish(pending);

        // external edit rewrites the file with a different editor state
        let other = make_storage(&dir, "settings.json", false);
        let mut edited = StorageData::new(CURRENT_FORMAT_VERSION);
        edited.set_state("editor", state("two"));
        edited.set_state("vcs", state("v"));
        other.write_pending(&edited);

        let changed = storage
            .analyze_external_change()
            .expect("analyze")
            .expect("comparable");
        assert_eq!(changed.len(), 1);
        assert!(changed.contains("editor"));

        // the new snapshot is published
        assert_eq!(storage.state("editor").expect("read"), Some(state("two")));
    }
}
