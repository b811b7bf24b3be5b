//! Filesystem change bridge
//!
//! The core store only consumes [`ChangedStorage`] batches; where those come
//! from is up to the embedder. This optional bridge produces them from
//! filesystem events: it watches resolved storage paths and coalesces the
//! raw event stream into per-storage change batches, drained on the caller's
//! configuration context.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, TryRecvError};
use std::sync::Arc;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use crate::error::StoreResult;
use crate::manager::StorageManager;
use crate::storage::Storage;
use crate::store::ChangedStorage;

/// Watches storage paths and turns filesystem events into change batches
pub struct StorageWatcher {
    watcher: RecommendedWatcher,
    events: Receiver<notify::Result<notify::Event>>,
    watched: HashMap<PathBuf, String>,
}

impl StorageWatcher {
    /// Create a watcher with no watched storages
    pub fn new() -> StoreResult<Self> {
        let (tx, rx) = channel();
        let watcher = RecommendedWatcher::new(
            move |event: notify::Result<notify::Event>| {
                let _ = tx.send(event);
            },
            notify::Config::default(),
        )?;
        Ok(StorageWatcher {
            watcher,
            events: rx,
            watched: HashMap::new(),
        })
    }

    /// Watch a storage's backing file or directory
    ///
    /// A path that does not exist yet is remembered but not watched; call
    /// again once it exists.
    pub fn watch_storage(&mut self, storage: &Arc<dyn Storage>) -> StoreResult<()> {
        let path = storage.path().to_path_buf();
        if path.exists() {
            let mode = if path.is_dir() {
                RecursiveMode::Recursive
            } else {
                RecursiveMode::NonRecursive
            };
            self.watcher.watch(&path, mode)?;
            debug!(path = %path.display(), "storage watched");
        }
        self.watched.insert(path, storage.key().to_string());
        Ok(())
    }

    /// Stop watching a path
    pub fn unwatch(&mut self, path: &Path) -> StoreResult<()> {
        if self.watched.remove(path).is_some() && path.exists() {
            self.watcher.unwatch(path)?;
        }
        Ok(())
    }

    /// Drain pending filesystem events into per-storage change batches
    ///
    /// Events are coalesced: each storage appears once, with the deduplicated
    /// set of files the events named. Storages not resolved by `manager` are
    /// skipped — nothing in the store can be affected by content it never
    /// loaded.
    pub fn drain_changes(&self, manager: &StorageManager) -> Vec<ChangedStorage> {
        let mut files_by_key: HashMap<String, BTreeSet<PathBuf>> = HashMap::new();
        loop {
            match self.events.try_recv() {
                Ok(Ok(event)) => {
                    for path in event.paths {
                        if let Some(key) = self.storage_key_for(&path) {
                            files_by_key.entry(key).or_default().insert(path);
                        }
                    }
                }
                Ok(Err(e)) => warn!(error = %e, "file watching error"),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        let mut changes = Vec::new();
        for (key, files) in files_by_key {
            match manager.cached_storage(&key) {
                Some(storage) => changes.push(ChangedStorage {
                    storage,
                    files: files.into_iter().collect(),
                }),
                None => debug!(storage = %key, "change for unresolved storage ignored"),
            }
        }
        changes.sort_by(|a, b| a.storage.key().cmp(b.storage.key()));
        changes
    }

    fn storage_key_for(&self, path: &Path) -> Option<String> {
        self.watched
            .iter()
            .find(|(root, _)| path.starts_with(root))
            .map(|(_, key)| key.clone())
    }
}
