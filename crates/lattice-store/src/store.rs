//! Component store orchestration
//!
//! The [`ComponentStore`] is the per-owner entry point: components register
//! with a persistence declaration, load their state from the first storage
//! target that has any (merged onto built-in defaults where supported), are
//! saved through the two-phase protocol in deterministic name order, and are
//! selectively reinitialized when storages change out of process.
//!
//! Owner kinds (application, project, module) differ only by their
//! [`StorePolicy`]; there is one store implementation.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::component::{PersistenceSpec, PersistentComponent, SettingsSaver, StorageTarget};
use crate::element::StateElement;
use crate::error::{StoreError, StoreResult};
use crate::macros::PathMacros;
use crate::manager::StorageManager;
use crate::storage::{CommitOutcome, ReadonlyFile, Storage};

/// Owner policy: what kind of store this is and where component state lives
/// when a component declares no targets of its own
#[derive(Debug, Clone)]
pub struct StorePolicy {
    /// Root tag of this owner's documents
    pub root_tag: String,
    /// Targets used by components that declare none
    pub default_targets: Vec<StorageTarget>,
}

impl StorePolicy {
    /// Create a policy with the given root tag and no default targets
    pub fn new(root_tag: impl Into<String>) -> Self {
        StorePolicy {
            root_tag: root_tag.into(),
            default_targets: Vec::new(),
        }
    }

    /// Application-level store policy
    pub fn application() -> Self {
        StorePolicy::new("application")
    }

    /// Project-level store policy
    pub fn project() -> Self {
        StorePolicy::new("project")
    }

    /// Module-level store policy
    pub fn module() -> Self {
        StorePolicy::new("module")
    }

    /// Set the default storage targets
    pub fn with_default_targets(mut self, targets: Vec<StorageTarget>) -> Self {
        self.default_targets = targets;
        self
    }
}

/// Notification sink for store events
///
/// Replaces a message bus: the owner injects whatever fan-out it needs.
pub trait StoreListener: Send + Sync {
    /// A batch of component reinitializations is starting
    fn batch_update_started(&self) {}

    /// The batch finished; fires even when individual reinits failed
    fn batch_update_finished(&self) {}

    /// A component's stored state referenced macros with no definition
    fn unresolved_macros(&self, _component: &str, _macros: &BTreeSet<String>) {}
}

/// Listener that ignores every event
pub struct NullListener;

impl StoreListener for NullListener {}

/// One storage reported changed from outside the process
pub struct ChangedStorage {
    /// The affected storage
    pub storage: Arc<dyn Storage>,
    /// Files the notification named, for user-facing causes
    pub files: Vec<PathBuf>,
}

#[derive(Clone)]
struct RegisteredComponent {
    spec: PersistenceSpec,
    component: Arc<dyn PersistentComponent>,
    defaults: Option<StateElement>,
}

/// Per-owner component store
pub struct ComponentStore {
    policy: StorePolicy,
    manager: Arc<StorageManager>,
    macros: Arc<PathMacros>,
    listener: Arc<dyn StoreListener>,
    components: RwLock<BTreeMap<String, RegisteredComponent>>,
    settings_savers: RwLock<Vec<Arc<dyn SettingsSaver>>>,
}

impl ComponentStore {
    /// Create a store over an explicitly injected capability set: the owner
    /// policy, the storage factory and the notification sink
    pub fn new(
        policy: StorePolicy,
        manager: Arc<StorageManager>,
        listener: Arc<dyn StoreListener>,
    ) -> Self {
        if manager.root_tag() != policy.root_tag {
            warn!(
                manager = %manager.root_tag(),
                policy = %policy.root_tag,
                "storage manager and store policy disagree on the owner root tag"
            );
        }
        let macros = manager.macros().clone();
        ComponentStore {
            policy,
            manager,
            macros,
            listener,
            components: RwLock::new(BTreeMap::new()),
            settings_savers: RwLock::new(Vec::new()),
        }
    }

    /// The storage manager backing this store
    pub fn manager(&self) -> &Arc<StorageManager> {
        &self.manager
    }

    /// Register a component under its persistence declaration
    ///
    /// A spec without targets falls back to the owner policy's default
    /// targets, resolved once here and cached for the component's lifetime.
    /// Built-in defaults are captured once at registration.
    pub fn register_component(
        &self,
        mut spec: PersistenceSpec,
        component: Arc<dyn PersistentComponent>,
    ) -> StoreResult<()> {
        if spec.targets.is_empty() {
            spec.targets = self.policy.default_targets.clone();
        }
        if spec.targets.is_empty() {
            return Err(StoreError::no_storage_target(&spec.name));
        }
        let name = spec.name.clone();
        let defaults = component.default_state().filter(|d| !d.is_empty());
        let registered = RegisteredComponent {
            spec,
            component,
            defaults,
        };
        if self
            .components
            .write()
            .insert(name.clone(), registered)
            .is_some()
        {
            return Err(StoreError::internal(format!(
                "component {name} registered twice"
            )));
        }
        debug!(component = %name, "component registered");
        Ok(())
    }

    /// Register a settings-saving participant; the list is append-only and
    /// iterated over a stable view during save
    pub fn register_settings_saver(&self, saver: Arc<dyn SettingsSaver>) {
        self.settings_savers.write().push(saver);
    }

    /// Names of all registered components, sorted
    pub fn component_names(&self) -> Vec<String> {
        self.components.read().keys().cloned().collect()
    }

    /// Load every registered component from its storage targets
    ///
    /// Each component deserializes the first target that has state for it,
    /// merged onto built-in defaults when the component supports partial
    /// merge; a component with no stored state keeps its defaults.
    pub fn load(&self) -> StoreResult<()> {
        let entries: Vec<(String, RegisteredComponent)> = self
            .components
            .read()
            .iter()
            .map(|(name, reg)| (name.clone(), reg.clone()))
            .collect();
        for (name, registered) in entries {
            self.load_component(&name, &registered)?;
        }
        Ok(())
    }

    /// Save every registered component and settings saver
    ///
    /// All components are externalized (in name-sorted order) before any
    /// storage commits. A storage whose file is read-only is never an error:
    /// it is appended to `readonly_files` with enough identity to retry
    /// after making the file writable, while every other session still
    /// commits. All remaining failures are collected and raised once, as an
    /// aggregate, after every pending session was attempted.
    pub fn save(&self, readonly_files: &mut Vec<ReadonlyFile>) -> StoreResult<()> {
        let entries: Vec<(String, RegisteredComponent)> = self
            .components
            .read()
            .iter()
            .map(|(name, reg)| (name.clone(), reg.clone()))
            .collect();
        let savers: Vec<Arc<dyn SettingsSaver>> = self.settings_savers.read().clone();
        if entries.is_empty() && savers.is_empty() {
            return Ok(());
        }

        let mut failures: Vec<StoreError> = Vec::new();
        let mut session = self.manager.start_externalization();

        for (name, registered) in &entries {
            let targets = registered.spec.write_targets();
            if targets.is_empty() {
                continue;
            }
            match registered.component.serialize_state() {
                Ok(state) => {
                    let state = state.filter(|element| !element.is_empty());
                    // macro resolution failures and missing splitters are
                    // structural; they abort the cycle immediately
                    session.set_state(name, &targets, state)?;
                }
                Err(e) => {
                    warn!(component = %name, error = %e, "state serialization failed, component skipped this cycle");
                    failures.push(StoreError::serialization(name, e.to_string()));
                }
            }
        }

        for saver in savers {
            if let Err(e) = saver.save_settings() {
                warn!(saver = %saver.name(), error = %e, "settings saver failed");
                failures.push(e);
            }
        }

        for save_session in session.into_save_sessions() {
            let key = save_session.storage_key().to_string();
            match save_session.commit() {
                CommitOutcome::Committed => debug!(storage = %key, "storage committed"),
                CommitOutcome::Skipped => {}
                CommitOutcome::ReadOnly(file) => {
                    info!(path = %file.path.display(), "storage file is read-only, deferred");
                    readonly_files.push(file);
                }
                CommitOutcome::Failed(e) => {
                    error!(storage = %key, error = %e, "storage commit failed");
                    failures.push(e);
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(StoreError::save_aggregate(failures))
        }
    }

    /// React to out-of-process storage changes
    ///
    /// Every affected storage recomputes its snapshot and reports changed
    /// component names; the union is partitioned into reloadable components
    /// (reinitialized in place here) and the rest, which is returned — empty
    /// means everything reloaded. When the returned set is non-empty, saving
    /// has been disabled on every implicated storage so an in-flight save
    /// cannot clobber the external edit while the caller negotiates a
    /// restart; nothing has been written.
    pub fn reload(&self, changes: &[ChangedStorage]) -> StoreResult<BTreeSet<String>> {
        let mut changed_names: BTreeSet<String> = BTreeSet::new();
        for change in changes {
            match change.storage.analyze_external_change()? {
                Some(names) => changed_names.extend(names),
                None => {
                    // incomparable content: every component of this storage
                    // counts as changed
                    changed_names.extend(self.components_targeting(change.storage.key()));
                }
            }
        }

        let registry = self.components.read();
        let mut reloadable = BTreeSet::new();
        let mut not_reloadable = BTreeSet::new();
        for name in changed_names {
            if let Some(registered) = registry.get(&name) {
                if registered.spec.reloadable {
                    reloadable.insert(name);
                } else {
                    not_reloadable.insert(name);
                }
            }
        }
        drop(registry);

        if !not_reloadable.is_empty() {
            for change in changes {
                change.storage.set_save_enabled(false);
            }
            info!(
                components = ?not_reloadable,
                "non-reloadable components changed externally, saving paused"
            );
        }

        if !reloadable.is_empty() {
            self.reinit_components(&reloadable);
        }
        Ok(not_reloadable)
    }

    /// Reinitialize a batch of components in place
    ///
    /// The batch is bracketed with started/finished notifications; a failed
    /// individual reinit is logged and never re-thrown, so the batch always
    /// completes and the finished notification always fires.
    pub fn reinit_components(&self, names: &BTreeSet<String>) {
        self.listener.batch_update_started();
        for name in names {
            let registered = self.components.read().get(name).cloned();
            match registered {
                Some(registered) => {
                    if let Err(e) = self.load_component(name, &registered) {
                        error!(component = %name, error = %e, "component reinit failed");
                    }
                }
                None => warn!(component = %name, "reinit requested for unregistered component"),
            }
        }
        self.listener.batch_update_finished();
    }

    fn load_component(&self, name: &str, registered: &RegisteredComponent) -> StoreResult<()> {
        let mut loaded = None;
        for target in registered.spec.read_targets() {
            let storage = self.manager.resolve(target)?;
            if let Some(state) = storage.state(name)? {
                debug!(component = %name, storage = %storage.key(), "state loaded");
                loaded = Some(state);
                break;
            }
        }

        let state = match loaded {
            Some(disk) => match (&registered.defaults, registered.spec.merge_defaults) {
                (Some(defaults), true) => Some(merge_onto_defaults(defaults, disk)),
                _ => Some(disk),
            },
            None => registered.defaults.clone(),
        };
        if let Some(state) = state {
            registered.component.load_state(state);
        }

        let unresolved = self.macros.unresolved_for(name);
        if !unresolved.is_empty() {
            self.listener.unresolved_macros(name, &unresolved);
        }
        Ok(())
    }

    /// Registered components with a read target resolving to `key`
    fn components_targeting(&self, key: &str) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        let registry = self.components.read();
        for (name, registered) in registry.iter() {
            for target in registered.spec.read_targets() {
                match self.manager.expand_macros(&target.path) {
                    Ok(expanded) if expanded == key => {
                        names.insert(name.clone());
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(component = %name, error = %e, "target not expandable, skipped");
                    }
                }
            }
        }
        names
    }
}

/// Overlay disk state onto built-in defaults
///
/// Attributes and text from disk win; children replace default children with
/// the same tag and `name` attribute, and default-only children survive.
fn merge_onto_defaults(defaults: &StateElement, disk: StateElement) -> StateElement {
    let mut merged = defaults.clone();
    merged.tag = disk.tag;
    for (name, value) in disk.attributes {
        merged.set_attribute(name, value);
    }
    if disk.text.is_some() {
        merged.text = disk.text;
    }
    for child in disk.children {
        let slot = merged.children.iter().position(|existing| {
            existing.tag == child.tag && existing.attribute("name") == child.attribute("name")
        });
        match slot {
            Some(index) => merged.children[index] = child,
            None => merged.children.push(child),
        }
    }
    merged
}
