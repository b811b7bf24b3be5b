//! Component persistence declarations
//!
//! Components declare where their state lives through a [`PersistenceSpec`]
//! attached at registration time: an ordered list of storage targets plus
//! the component's reload and merge behavior. The spec is resolved once and
//! cached by the store; nothing is re-derived later.

use serde::{Deserialize, Serialize};

use crate::element::StateElement;
use crate::error::StoreResult;

/// Roaming/sharing classification of a storage target
///
/// Carried as declarative metadata for an outer settings-sync layer; it does
/// not alter local resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoamingClass {
    /// Shareable across machines
    Default,
    /// Stays on this machine
    PerMachine,
    /// Never exported
    Disabled,
}

/// Declarative description of one place a component's state may live
#[derive(Debug, Clone)]
pub struct StorageTarget {
    /// Storage path, possibly macro-valued (`$APP_CONFIG$/editor.json`)
    pub path: String,
    /// Roaming/sharing classification
    pub roaming: RoamingClass,
    /// Splitter identifier; presence selects directory-based storage
    pub splitter: Option<String>,
    /// Deprecated targets are read for migration and drained on save
    pub deprecated: bool,
    /// Critical storages block writes instead of silently recreating
    /// truncated content
    pub critical: bool,
    /// Skip this target when reading
    pub skip_read: bool,
    /// Skip this target when writing
    pub skip_write: bool,
}

impl StorageTarget {
    /// Create a file-based target with default policy
    pub fn new(path: impl Into<String>) -> Self {
        StorageTarget {
            path: path.into(),
            roaming: RoamingClass::Default,
            splitter: None,
            deprecated: false,
            critical: false,
            skip_read: false,
            skip_write: false,
        }
    }

    /// Create a directory-based target governed by the named splitter
    pub fn split(path: impl Into<String>, splitter: impl Into<String>) -> Self {
        let mut target = StorageTarget::new(path);
        target.splitter = Some(splitter.into());
        target
    }

    /// Mark this target deprecated
    pub fn deprecated(mut self) -> Self {
        self.deprecated = true;
        self
    }

    /// Mark this target critical
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    /// Set the roaming class
    pub fn roaming(mut self, roaming: RoamingClass) -> Self {
        self.roaming = roaming;
        self
    }

    /// Skip this target for reads
    pub fn skip_read(mut self) -> Self {
        self.skip_read = true;
        self
    }

    /// Skip this target for writes
    pub fn skip_write(mut self) -> Self {
        self.skip_write = true;
        self
    }
}

/// Per-component persistence declaration, attached at registration
#[derive(Debug, Clone)]
pub struct PersistenceSpec {
    /// Unique component name
    pub name: String,
    /// Ordered storage targets; empty falls back to the owner policy's
    /// default targets
    pub targets: Vec<StorageTarget>,
    /// Explicit target override, as an index into `targets`
    pub preferred_target: Option<usize>,
    /// Whether the component can be reinitialized in place on external
    /// change
    pub reloadable: bool,
    /// Whether disk state is merged onto the component's built-in defaults
    pub merge_defaults: bool,
}

impl PersistenceSpec {
    /// Create a spec with a single target and default behavior
    pub fn new(name: impl Into<String>, target: StorageTarget) -> Self {
        PersistenceSpec {
            name: name.into(),
            targets: vec![target],
            preferred_target: None,
            reloadable: true,
            merge_defaults: false,
        }
    }

    /// Create a spec with several candidate targets
    pub fn with_targets(name: impl Into<String>, targets: Vec<StorageTarget>) -> Self {
        PersistenceSpec {
            name: name.into(),
            targets,
            preferred_target: None,
            reloadable: true,
            merge_defaults: false,
        }
    }

    /// Mark the component non-reloadable
    pub fn not_reloadable(mut self) -> Self {
        self.reloadable = false;
        self
    }

    /// Enable merging disk state onto built-in defaults
    pub fn merge_defaults(mut self) -> Self {
        self.merge_defaults = true;
        self
    }

    /// Prefer the target at `index` over declaration order
    pub fn prefer_target(mut self, index: usize) -> Self {
        self.preferred_target = Some(index);
        self
    }

    /// Targets to consult on read, in resolution order
    ///
    /// Explicit override first, then non-deprecated targets in declaration
    /// order, then deprecated ones; targets marked skip-read are dropped.
    pub fn read_targets(&self) -> Vec<&StorageTarget> {
        self.ordered_targets()
            .into_iter()
            .filter(|t| !t.skip_read)
            .collect()
    }

    /// Targets touched on write, in resolution order
    ///
    /// The first entry receives the state; every following entry receives a
    /// removal so deprecated locations drain as components migrate.
    pub fn write_targets(&self) -> Vec<&StorageTarget> {
        self.ordered_targets()
            .into_iter()
            .filter(|t| !t.skip_write)
            .collect()
    }

    fn ordered_targets(&self) -> Vec<&StorageTarget> {
        let mut ordered: Vec<&StorageTarget> = Vec::with_capacity(self.targets.len());
        if let Some(index) = self.preferred_target {
            if let Some(target) = self.targets.get(index) {
                ordered.push(target);
            }
        }
        for target in self.targets.iter().filter(|t| !t.deprecated) {
            if !ordered.iter().any(|o| std::ptr::eq(*o, target)) {
                ordered.push(target);
            }
        }
        for target in self.targets.iter().filter(|t| t.deprecated) {
            if !ordered.iter().any(|o| std::ptr::eq(*o, target)) {
                ordered.push(target);
            }
        }
        ordered
    }
}

/// A named, independently persisted unit of application state
pub trait PersistentComponent: Send + Sync {
    /// Serialize the component's current state
    ///
    /// `None` (or an empty element) means the component has nothing to
    /// persist and any stored entry is removed.
    fn serialize_state(&self) -> StoreResult<Option<StateElement>>;

    /// Apply loaded state
    fn load_state(&self, state: StateElement);

    /// Built-in default state, captured once at registration
    fn default_state(&self) -> Option<StateElement> {
        None
    }
}

/// Settings-saving participants that serialize themselves outside the
/// normal component state protocol
///
/// Their failures are collected into the save cycle's aggregate error
/// without aborting other work.
pub trait SettingsSaver: Send + Sync {
    /// Identifier used in logs and error messages
    fn name(&self) -> &str;

    /// Write the settings this saver owns
    fn save_settings(&self) -> StoreResult<()>;
}
