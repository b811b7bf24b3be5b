//! Directory-based storage: one file per split sub-state
//!
//! A splitter maps one component's state into `(sub-state, file name)` pairs
//! (per-module files, for instance). Each file carries a component wrapper
//! with the owning component's name so reload can reassemble the sub-states
//! into one logical state. External-change analysis recomputes the whole
//! directory snapshot and diffs it against the previous one; there is no
//! incremental single-file reload.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::data::StorageData;
use crate::document::{
    merge_substates, parse_fragment, render_fragment, DocumentFormat, CURRENT_FORMAT_VERSION,
};
use crate::element::StateElement;
use crate::error::{IoOperation, StoreError, StoreResult};
use crate::macros::PathMacros;
use crate::storage::{
    content_identical, is_readonly_error, path_is_readonly, CommitOutcome, ReadonlyFile,
    SnapshotCell, Storage,
};

/// Maps one component's state into named sub-states for directory storage
pub trait StateSplitter: Send + Sync {
    /// Split a state into `(sub-state, file name)` pairs
    ///
    /// File names must be unique within the component and carry an extension
    /// the document formats recognize.
    fn split(&self, state: &StateElement) -> Vec<(StateElement, String)>;
}

/// Splitter that writes each child element to a file named by one of its
/// attributes
pub struct NamedChildSplitter {
    attribute: String,
    extension: String,
}

impl NamedChildSplitter {
    /// Split children by `attribute`, writing `<value>.<extension>` files
    pub fn new(attribute: impl Into<String>, format: DocumentFormat) -> Self {
        NamedChildSplitter {
            attribute: attribute.into(),
            extension: format.extension().to_string(),
        }
    }
}

impl StateSplitter for NamedChildSplitter {
    fn split(&self, state: &StateElement) -> Vec<(StateElement, String)> {
        let mut parts = Vec::new();
        for child in &state.children {
            let Some(value) = child.attribute(&self.attribute) else {
                warn!(tag = %child.tag, attribute = %self.attribute, "child without file-name attribute, skipping");
                continue;
            };
            let substate = StateElement::new(state.tag.clone()).with_child(child.clone());
            parts.push((substate, format!("{value}.{}", self.extension)));
        }
        parts
    }
}

/// Storage that spreads one logical snapshot over a directory of files
pub struct DirectoryStorage {
    key: String,
    path: PathBuf,
    format: DocumentFormat,
    splitter: Arc<dyn StateSplitter>,
    macros: Arc<PathMacros>,
    snapshot: SnapshotCell,
    save_enabled: AtomicBool,
}

impl DirectoryStorage {
    pub(crate) fn new(
        key: String,
        path: PathBuf,
        format: DocumentFormat,
        splitter: Arc<dyn StateSplitter>,
        macros: Arc<PathMacros>,
    ) -> Self {
        DirectoryStorage {
            key,
            path,
            format,
            splitter,
            macros,
            snapshot: SnapshotCell::new(),
            save_enabled: AtomicBool::new(true),
        }
    }

    /// File names currently present with a recognized document extension,
    /// sorted for deterministic reassembly
    fn existing_files(&self) -> StoreResult<BTreeMap<String, DocumentFormat>> {
        let mut files = BTreeMap::new();
        if !self.path.exists() {
            return Ok(files);
        }
        for entry in WalkDir::new(&self.path).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| {
                StoreError::io(
                    self.path.clone(),
                    IoOperation::Read,
                    e.into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("walk failed")),
                )
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            if let Some(format) = DocumentFormat::for_path(Path::new(name)) {
                files.insert(name.to_string(), format);
            }
        }
        Ok(files)
    }

    fn load(&self) -> StoreResult<StorageData> {
        let mut substates: BTreeMap<String, Vec<StateElement>> = BTreeMap::new();
        for (file_name, format) in self.existing_files()? {
            let file_path = self.path.join(&file_name);
            let bytes = fs::read(&file_path)
                .map_err(|e| StoreError::io(file_path.clone(), IoOperation::Read, e))?;
            match parse_fragment(&bytes, format, &file_path) {
                Ok((component, mut parts)) => {
                    substates.entry(component).or_default().append(&mut parts);
                }
                Err(e) => {
                    warn!(
                        path = %file_path.display(),
                        error = %e,
                        "corrupt sub-state file ignored; it will be recreated on save"
                    );
                }
            }
        }

        let mut data = StorageData::new(CURRENT_FORMAT_VERSION);
        for (component, parts) in substates {
            if let Some(mut merged) = merge_substates(parts) {
                self.macros.expand_element(&component, &mut merged);
                data.set_state(&component, merged);
            }
        }
        Ok(data)
    }

    /// Render the pending snapshot into its per-file byte contents
    fn split_files(&self, pending: &StorageData) -> StoreResult<BTreeMap<String, Vec<u8>>> {
        let mut files = BTreeMap::new();
        for (component, state) in pending.iter() {
            let mut element = state.element().clone();
            self.macros.collapse_element(&mut element);
            for (substate, file_name) in self.splitter.split(&element) {
                let format = DocumentFormat::for_path(Path::new(&file_name)).unwrap_or(self.format);
                let bytes = render_fragment(component, substate, format)?;
                if files.insert(file_name.clone(), bytes).is_some() {
                    warn!(
                        file = %file_name,
                        component,
                        "splitter produced a duplicate file name, keeping the last"
                    );
                }
            }
        }
        Ok(files)
    }

    fn write_one(&self, file_path: &Path, bytes: &[u8]) -> CommitOutcome {
        if path_is_readonly(file_path) {
            return CommitOutcome::ReadOnly(ReadonlyFile {
                path: file_path.to_path_buf(),
                storage_key: self.key.clone(),
            });
        }
        match fs::write(file_path, bytes) {
            Ok(()) => CommitOutcome::Committed,
            Err(e) if is_readonly_error(&e) => CommitOutcome::ReadOnly(ReadonlyFile {
                path: file_path.to_path_buf(),
                storage_key: self.key.clone(),
            }),
            Err(e) => CommitOutcome::Failed(StoreError::io(
                file_path.to_path_buf(),
                IoOperation::Write,
                e,
            )),
        }
    }

    fn remove_directory_if_empty(&self) {
        match fs::remove_dir(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "deleted empty storage directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "storage directory not removed");
            }
        }
    }
}

impl Storage for DirectoryStorage {
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
        let new_files = match self.split_files(pending) {
            Ok(files) => files,
            Err(e) => return CommitOutcome::Failed(e),
        };
        let existing = match self.existing_files() {
            Ok(existing) => existing,
            Err(e) => return CommitOutcome::Failed(e),
        };

        let mut wrote_anything = false;
        let mut readonly: Option<ReadonlyFile> = None;
        let mut failure: Option<StoreError> = None;

        if !new_files.is_empty() && !self.path.exists() {
            if let Err(e) = fs::create_dir_all(&self.path) {
                return CommitOutcome::Failed(StoreError::io(
                    self.path.clone(),
                    IoOperation::CreateDir,
                    e,
                ));
            }
        }

        // write dirty files
        for (file_name, bytes) in &new_files {
            let file_path = self.path.join(file_name);
            if let Ok(on_disk) = fs::read(&file_path) {
                if content_identical(&on_disk, bytes) {
                    continue;
                }
            }
            match self.write_one(&file_path, bytes) {
                CommitOutcome::Committed => wrote_anything = true,
                CommitOutcome::ReadOnly(file) => {
                    readonly.get_or_insert(file);
                }
                CommitOutcome::Failed(e) => {
                    warn!(path = %file_path.display(), error = %e, "sub-state write failed");
                    failure.get_or_insert(e);
                }
                CommitOutcome::Skipped => {}
            }
        }

        // delete files no longer referenced by any component
        for file_name in existing.keys() {
            if new_files.contains_key(file_name) {
                continue;
            }
            let file_path = self.path.join(file_name);
            match fs::remove_file(&file_path) {
                Ok(()) => {
                    debug!(path = %file_path.display(), "deleted orphaned sub-state file");
                    wrote_anything = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) if is_readonly_error(&e) => {
                    readonly.get_or_insert(ReadonlyFile {
                        path: file_path,
                        storage_key: self.key.clone(),
                    });
                }
                Err(e) => {
                    failure
                        .get_or_insert(StoreError::io(file_path, IoOperation::Delete, e));
                }
            }
        }

        if new_files.is_empty() && failure.is_none() && readonly.is_none() {
            self.remove_directory_if_empty();
        }

        if let Some(e) = failure {
            CommitOutcome::Failed(e)
        } else if let Some(file) = readonly {
            CommitOutcome::ReadOnly(file)
        } else if wrote_anything {
            CommitOutcome::Committed
        } else {
            CommitOutcome::Skipped
        }
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
    use crate::macros::MacroTable;
    use tempfile::TempDir;

    fn make_storage(dir: &TempDir) -> DirectoryStorage {
        let path = dir.path().join("modules");
        DirectoryStorage::new(
            path.to_string_lossy().into_owned(),
            path,
            DocumentFormat::Json,
            Arc::new(NamedChildSplitter::new("name", DocumentFormat::Json)),
            Arc::new(PathMacros::new(MacroTable::new())),
        )
    }

    fn modules(names: &[&str]) -> StateElement {
        let mut state = StateElement::new("modules");
        for name in names {
            state
                .children
                .push(StateElement::new("module").with_attribute("name", *name));
        }
        state
    }

    #[test]
    fn test_split_save_and_reload() {
        let dir = TempDir::new().expect("temp dir");
        let storage = make_storage(&dir);

        let mut pending = StorageData::new(CURRENT_FORMAT_VERSION);
        pending.set_state("ModuleManager", modules(&["alpha", "beta"]));
        assert!(matches!(
            storage.write_pending(&pending),
            CommitOutcome::Committed
        ));

        assert!(storage.path().join("alpha.json").exists());
        assert!(storage.path().join("beta.json").exists());

        let fresh = DirectoryStorage::new(
            storage.key().to_string(),
            storage.path().to_path_buf(),
            DocumentFormat::Json,
            Arc::new(NamedChildSplitter::new("name", DocumentFormat::Json)),
            Arc::new(PathMacros::new(MacroTable::new())),
        );
        let loaded = fresh
            .state("ModuleManager")
            .expect("read")
            .expect("present");
        assert_eq!(loaded.children.len(), 2);
        assert_eq!(loaded.tag, "modules");
    }

    #[test]
    fn test_orphaned_files_are_deleted() {
        let dir = TempDir::new().expect("temp dir");
        let storage = make_storage(&dir);

        let mut pending = StorageData::new(CURRENT_FORMAT_VERSION);
        pending.set_state("ModuleManager", modules(&["alpha", "beta"]));
        storage.write_pending(&pending);

        let mut smaller = StorageData::new(CURRENT_FORMAT_VERSION);
        smaller.set_state("ModuleManager", modules(&["alpha"]));
        assert!(matches!(
            storage.write_pending(&smaller),
            CommitOutcome::Committed
        ));

        assert!(storage.path().join("alpha.json").exists());
        assert!(!storage.path().join("beta.json").exists());
    }

    #[test]
    fn test_empty_snapshot_deletes_directory() {
        let dir = TempDir::new().expect("temp dir");
        let storage = make_storage(&dir);

        let mut pending = StorageData::new(CURRENT_FORMAT_VERSION);
        pending.set_state("ModuleManager", modules(&["alpha"]));
        storage.write_pending(&pending);
        assert!(storage.path().exists());

        let empty = StorageData::new(CURRENT_FORMAT_VERSION);
        storage.write_pending(&empty);
        assert!(!storage.path().exists());
    }

    #[test]
    fn test_unchanged_content_is_skipped() {
        let dir = TempDir::new().expect("temp dir");
        let storage = make_storage(&dir);

        let mut pending = StorageData::new(CURRENT_FORMAT_VERSION);
        pending.set_state("ModuleManager", modules(&["alpha"]));
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
    fn test_external_change_recomputes_whole_directory() {
        let dir = TempDir::new().expect("temp dir");
        let storage = make_storage(&dir);

        let mut pending = StorageData::new(CURRENT_FORMAT_VERSION);
        pending.set_state("ModuleManager", modules(&["alpha", "beta"]));
        storage.write_pending(&pending);
        storage.publish(pending);

        // external edit removes one module file
        fs::remove_file(storage.path().join("beta.json")).expect("delete");

        let changed = storage
            .analyze_external_change()
            .expect("analyze")
            .expect("comparable");
        assert_eq!(changed.len(), 1);
        assert!(changed.contains("ModuleManager"));
    }
}
