//! Two-phase save protocol
//!
//! A save cycle separates "compute what to write" from "commit to disk". The
//! [`ExternalizationSession`] accumulates, per storage, a pending snapshot
//! holding every declared change without touching disk. From it, one
//! [`SaveSession`] per actually-changed storage is derived; each commits its
//! pending snapshot and publishes it on success.
//!
//! All externalization completes before any commit starts, so one
//! component's serialization failure can never leave another component's
//! file half-committed. Commits across *different* storages are independent
//! and not transactional as a whole: a crash between two commits can leave
//! the storages at different save-cycle boundaries.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::component::StorageTarget;
use crate::data::StorageData;
use crate::element::StateElement;
use crate::error::StoreResult;
use crate::manager::StorageManager;
use crate::storage::{CommitOutcome, Storage};

struct PendingStorage {
    storage: Arc<dyn Storage>,
    data: StorageData,
    dirty: bool,
}

/// Accumulates pending component states for one save cycle
///
/// The pending snapshot per storage starts as a clone of the published one;
/// only this private copy is mutated, and it becomes the published snapshot
/// when its save session commits.
pub struct ExternalizationSession {
    manager: Arc<StorageManager>,
    pending: HashMap<String, PendingStorage>,
}

impl ExternalizationSession {
    pub(crate) fn new(manager: Arc<StorageManager>) -> Self {
        ExternalizationSession {
            manager,
            pending: HashMap::new(),
        }
    }

    /// Route one component's new state to its write targets
    ///
    /// The first target receives the state (`None` or an empty element is a
    /// removal); every following target receives a removal so deprecated
    /// locations drain as components migrate.
    pub fn set_state(
        &mut self,
        component: &str,
        targets: &[&StorageTarget],
        state: Option<StateElement>,
    ) -> StoreResult<()> {
        for (index, target) in targets.iter().enumerate() {
            let storage = self.manager.resolve(target)?;
            let key = storage.key().to_string();
            let entry = match self.pending.entry(key) {
                Entry::Occupied(occupied) => occupied.into_mut(),
                Entry::Vacant(vacant) => {
                    let data = storage.snapshot()?.as_ref().clone();
                    vacant.insert(PendingStorage {
                        storage,
                        data,
                        dirty: false,
                    })
                }
            };

            let changed = match (&state, index) {
                (Some(element), 0) => entry.data.set_state(component, element.clone()),
                _ => entry.data.remove(component),
            };
            if changed {
                debug!(component, storage = %entry.storage.key(), "component state changed");
                entry.dirty = true;
            }
        }
        Ok(())
    }

    /// Derive one save session per storage with pending changes
    ///
    /// Storages with saving disabled are skipped; their accumulated state is
    /// dropped so a paused storage is never clobbered mid-decision.
    pub fn into_save_sessions(self) -> Vec<SaveSession> {
        let mut sessions = Vec::new();
        for (key, pending) in self.pending {
            if !pending.dirty {
                continue;
            }
            if !pending.storage.save_enabled() {
                warn!(storage = %key, "saving disabled, dropping pending changes");
                continue;
            }
            sessions.push(SaveSession {
                storage: pending.storage,
                pending: pending.data,
            });
        }
        // deterministic commit order
        sessions.sort_by(|a, b| a.storage.key().cmp(b.storage.key()));
        sessions
    }
}

/// The commit phase for one storage's pending snapshot
pub struct SaveSession {
    storage: Arc<dyn Storage>,
    pending: StorageData,
}

impl SaveSession {
    /// Cache key of the storage this session commits
    pub fn storage_key(&self) -> &str {
        self.storage.key()
    }

    /// Commit the pending snapshot to durable media
    ///
    /// On success the pending snapshot becomes the storage's published
    /// snapshot. Read-only and failure conditions are returned as outcomes,
    /// never raised.
    pub fn commit(self) -> CommitOutcome {
        if !self.storage.save_enabled() {
            return CommitOutcome::Skipped;
        }
        match self.storage.write_pending(&self.pending) {
            outcome @ (CommitOutcome::Committed | CommitOutcome::Skipped) => {
                self.storage.publish(self.pending);
                outcome
            }
            outcome => outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macros::{MacroTable, PathMacros};
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> Arc<StorageManager> {
        let mut table = MacroTable::new();
        table.define("ROOT", dir.path().to_string_lossy());
        Arc::new(StorageManager::new(
            "project",
            Arc::new(PathMacros::new(table)),
        ))
    }

    fn state(value: &str) -> StateElement {
        StateElement::new("state").with_attribute("value", value)
    }

    #[test]
    fn test_no_disk_access_before_commit() {
        let dir = TempDir::new().expect("temp dir");
        let manager = manager(&dir);
        let target = StorageTarget::new("$ROOT$/settings.json");

        let mut session = manager.start_externalization();
        session
            .set_state("editor", &[&target], Some(state("one")))
            .expect("set state");

        assert!(!dir.path().join("settings.json").exists());

        for save in session.into_save_sessions() {
            assert!(matches!(save.commit(), CommitOutcome::Committed));
        }
        assert!(dir.path().join("settings.json").exists());
    }

    #[test]
    fn test_unchanged_state_produces_no_session() {
        let dir = TempDir::new().expect("temp dir");
        let manager = manager(&dir);
        let target = StorageTarget::new("$ROOT$/settings.json");

        let mut session = manager.start_externalization();
        session
            .set_state("editor", &[&target], Some(state("one")))
            .expect("set state");
        for save in session.into_save_sessions() {
            save.commit();
        }

        let mut session = manager.start_externalization();
        session
            .set_state("editor", &[&target], Some(state("one")))
            .expect("set state");
        assert!(session.into_save_sessions().is_empty());
    }

    #[test]
    fn test_deprecated_target_receives_removal() {
        let dir = TempDir::new().expect("temp dir");
        let manager = manager(&dir);
        let old = StorageTarget::new("$ROOT$/old.json").deprecated();
        let new = StorageTarget::new("$ROOT$/new.json");

        // seed the deprecated location
        let mut session = manager.start_externalization();
        session
            .set_state("editor", &[&old], Some(state("legacy")))
            .expect("set state");
        for save in session.into_save_sessions() {
            save.commit();
        }
        assert!(dir.path().join("old.json").exists());

        // migrating write: state to the new target, removal drains the old
        let mut session = manager.start_externalization();
        session
            .set_state("editor", &[&new, &old], Some(state("current")))
            .expect("set state");
        for save in session.into_save_sessions() {
            save.commit();
        }

        assert!(dir.path().join("new.json").exists());
        assert!(!dir.path().join("old.json").exists());
    }

    #[test]
    fn test_disabled_storage_drops_pending_changes() {
        let dir = TempDir::new().expect("temp dir");
        let manager = manager(&dir);
        let target = StorageTarget::new("$ROOT$/settings.json");

        let storage = manager.resolve(&target).expect("resolve");
        storage.set_save_enabled(false);

        let mut session = manager.start_externalization();
        session
            .set_state("editor", &[&target], Some(state("one")))
            .expect("set state");
        assert!(session.into_save_sessions().is_empty());
        assert!(!dir.path().join("settings.json").exists());
    }
}
