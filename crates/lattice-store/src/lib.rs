//! Lattice Persistent Component-State Store
//!
//! This crate keeps a set of named, independently-evolving components
//! durably synchronized with one or more on-disk storages. It tolerates
//! external edits, read-only files, legacy document versions, and partial
//! failures: one component's serialization error or one file's read-only
//! status never corrupts or blocks the others.
//!
//! # Modules
//!
//! - [`macros`]: bidirectional `$NAME$` path substitution for portable
//!   serialized state
//! - [`element`]: the opaque serialized state trees components exchange
//!   with the store
//! - [`data`]: per-storage snapshots with copy-on-write pending copies and
//!   an O(components) diff
//! - [`document`]: the on-disk document shape, JSON/YAML codecs and the
//!   legacy-version conversion chain
//! - [`component`]: declarative persistence specs attached at registration
//! - [`storage`]: the file-based and splitter-governed directory-based
//!   storage strategies
//! - [`manager`]: storage resolution and caching, and the save-cycle entry
//!   point
//! - [`session`]: the two-phase externalize-then-commit save protocol
//! - [`store`]: the per-owner component store orchestrator
//! - [`reload`]: the restart negotiation flow for non-reloadable external
//!   changes
//! - [`watcher`]: optional bridge from filesystem events to reload batches
//!
//! # Save cycle
//!
//! ```ignore
//! use lattice_store::{ComponentStore, StorePolicy, StorageManager};
//! use lattice_store::{MacroTable, PathMacros, NullListener};
//! use std::sync::Arc;
//!
//! let mut table = MacroTable::new();
//! table.define("PROJECT_DIR", "/work/demo");
//! let manager = Arc::new(StorageManager::new(
//!     "project",
//!     Arc::new(PathMacros::new(table)),
//! ));
//! let store = ComponentStore::new(StorePolicy::project(), manager, Arc::new(NullListener));
//! // register components, then:
//! store.load()?;
//! let mut readonly_files = Vec::new();
//! store.save(&mut readonly_files)?;
//! // readonly_files lists targets to retry after making them writable
//! # Ok::<(), lattice_store::StoreError>(())
//! ```
//!
//! # Concurrency
//!
//! The store introduces no concurrency of its own; file I/O is synchronous
//! and runs on whatever configuration context the caller chooses. All shared
//! structures (the storage cache, the component registry, the save-enabled
//! toggles) are safe against background change notifications and multiple
//! owners running their own stores.

pub mod component;
pub mod data;
pub mod document;
pub mod element;
pub mod error;
pub mod macros;
pub mod manager;
pub mod reload;
pub mod session;
pub mod storage;
pub mod store;
pub mod watcher;

// Re-export commonly used types
pub use component::{
    PersistenceSpec, PersistentComponent, RoamingClass, SettingsSaver, StorageTarget,
};
pub use data::{ComponentState, StorageData};
pub use document::{DocumentFormat, StateConverter, CURRENT_FORMAT_VERSION};
pub use element::StateElement;
pub use error::{IoOperation, StoreError, StoreResult};
pub use macros::{MacroTable, PathMacros};
pub use manager::StorageManager;
pub use reload::{ChangeCause, NegotiationOutcome, ReloadNegotiator, RestartDecider};
pub use session::{ExternalizationSession, SaveSession};
pub use storage::{
    CommitOutcome, DirectoryStorage, FileStorage, NamedChildSplitter, ReadonlyFile,
    StateSplitter, Storage,
};
pub use store::{ChangedStorage, ComponentStore, NullListener, StoreListener, StorePolicy};
pub use watcher::StorageWatcher;
