//! Reload/restart negotiation
//!
//! When an external change touches components that cannot be reinitialized
//! in place, the store pauses disk writes on the implicated storages and a
//! decision source (a dialog, a headless policy) accepts or declines a
//! restart. Accepting is terminal for this subsystem — the owning process is
//! expected to exit. Declining re-enables saving on exactly the storages
//! that were paused for the decision.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::StoreResult;
use crate::storage::Storage;
use crate::store::{ChangedStorage, ComponentStore};

/// Components named in the decision prompt before the "+N more" summary
const MAX_LISTED_COMPONENTS: usize = 10;

/// Why a restart is being proposed: one externally changed file and the
/// storage it belongs to
#[derive(Debug, Clone)]
pub struct ChangeCause {
    /// The changed file
    pub file: PathBuf,
    /// Cache key of the owning storage
    pub storage_key: String,
}

/// Yes/no decision source for restart proposals
pub trait RestartDecider: Send + Sync {
    /// Whether to restart now
    ///
    /// `components` is the human-readable list of non-reloadable component
    /// names, capped with a trailing "+N more" entry past a threshold.
    fn confirm_restart(&self, components: &[String], causes: &[ChangeCause]) -> bool;
}

/// Outcome of one external-change negotiation round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationOutcome {
    /// No change to handle
    NothingToDo,
    /// Every affected component reloaded in place
    Reloaded,
    /// The decision source accepted the restart; saving stays paused and
    /// the owning process is expected to exit
    RestartAccepted,
    /// The decision source declined; saving resumed on the paused storages
    Declined,
}

enum NegotiationState {
    Idle,
    RestartPending,
}

/// Drives the decision procedure for non-reloadable external changes
pub struct ReloadNegotiator {
    store: Arc<ComponentStore>,
    decider: Arc<dyn RestartDecider>,
    state: Mutex<NegotiationState>,
}

impl ReloadNegotiator {
    /// Create a negotiator over a store and a decision source
    pub fn new(store: Arc<ComponentStore>, decider: Arc<dyn RestartDecider>) -> Self {
        ReloadNegotiator {
            store,
            decider,
            state: Mutex::new(NegotiationState::Idle),
        }
    }

    /// Handle a batch of external storage changes
    ///
    /// Reloadable components are reinitialized by the store; when some are
    /// not reloadable the store has already paused saving on the implicated
    /// storages, and this asks the decision source whether to restart.
    pub fn on_external_changes(
        &self,
        changes: Vec<ChangedStorage>,
    ) -> StoreResult<NegotiationOutcome> {
        if changes.is_empty() {
            return Ok(NegotiationOutcome::NothingToDo);
        }
        if matches!(*self.state.lock(), NegotiationState::RestartPending) {
            warn!("restart already accepted, ignoring further external changes");
            return Ok(NegotiationOutcome::RestartAccepted);
        }

        let causes = collect_causes(&changes);
        let not_reloadable = self.store.reload(&changes)?;
        if not_reloadable.is_empty() {
            return Ok(NegotiationOutcome::Reloaded);
        }

        let paused: Vec<Arc<dyn Storage>> =
            changes.into_iter().map(|change| change.storage).collect();
        let names = capped_names(&not_reloadable);

        if self.decider.confirm_restart(&names, &causes) {
            info!(components = ?not_reloadable, "restart accepted, saving stays paused");
            *self.state.lock() = NegotiationState::RestartPending;
            Ok(NegotiationOutcome::RestartAccepted)
        } else {
            info!("restart declined, resuming saving on paused storages");
            for storage in &paused {
                storage.set_save_enabled(true);
            }
            *self.state.lock() = NegotiationState::Idle;
            Ok(NegotiationOutcome::Declined)
        }
    }
}

fn collect_causes(changes: &[ChangedStorage]) -> Vec<ChangeCause> {
    let mut causes = Vec::new();
    for change in changes {
        for file in &change.files {
            causes.push(ChangeCause {
                file: file.clone(),
                storage_key: change.storage.key().to_string(),
            });
        }
        if change.files.is_empty() {
            causes.push(ChangeCause {
                file: change.storage.path().to_path_buf(),
                storage_key: change.storage.key().to_string(),
            });
        }
    }
    causes
}

fn capped_names(names: &std::collections::BTreeSet<String>) -> Vec<String> {
    let mut listed: Vec<String> = names.iter().take(MAX_LISTED_COMPONENTS).cloned().collect();
    let remainder = names.len().saturating_sub(MAX_LISTED_COMPONENTS);
    if remainder > 0 {
        listed.push(format!("+{remainder} more"));
    }
    listed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_capped_names_short_list_is_unchanged() {
        let names: BTreeSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        assert_eq!(capped_names(&names), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_capped_names_summarizes_overflow() {
        let names: BTreeSet<String> = (0..14).map(|i| format!("component{i:02}")).collect();
        let listed = capped_names(&names);
        assert_eq!(listed.len(), MAX_LISTED_COMPONENTS + 1);
        assert_eq!(listed.last().map(String::as_str), Some("+4 more"));
    }
}
