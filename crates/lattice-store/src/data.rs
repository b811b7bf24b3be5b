//! Storage snapshots and snapshot diffing
//!
//! A [`StorageData`] is the full content of one storage at a point in time:
//! a keyed mapping from component name to serialized state. Published
//! snapshots are never mutated in place — a save cycle clones the published
//! snapshot, mutates its private pending copy, and swaps it in on commit, so
//! a reader never observes a partially-updated snapshot.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use crate::element::StateElement;

/// One component's stored state plus a lazily cached content fingerprint
#[derive(Debug, Clone)]
pub struct ComponentState {
    element: StateElement,
    digest: OnceLock<[u8; 32]>,
}

impl ComponentState {
    /// Wrap a state tree
    pub fn new(element: StateElement) -> Self {
        ComponentState {
            element,
            digest: OnceLock::new(),
        }
    }

    /// The state tree
    pub fn element(&self) -> &StateElement {
        &self.element
    }

    /// Take the state tree out
    pub fn into_element(self) -> StateElement {
        self.element
    }

    /// Content fingerprint, computed once on demand
    pub fn digest(&self) -> [u8; 32] {
        *self.digest.get_or_init(|| self.element.fingerprint())
    }

    /// Content comparison: digest equality when both sides already carry a
    /// digest, structural equality otherwise
    pub fn matches(&self, other: &ComponentState) -> bool {
        match (self.digest.get(), other.digest.get()) {
            (Some(a), Some(b)) => a == b,
            _ => self.element == other.element,
        }
    }
}

impl PartialEq for ComponentState {
    fn eq(&self, other: &Self) -> bool {
        self.matches(other)
    }
}

/// Snapshot of one storage's content
///
/// Component names are unique within a snapshot. Setting an empty state is a
/// removal. The format `version` travels with the snapshot; snapshots with
/// different versions cannot be compared component-by-component.
#[derive(Debug, Clone)]
pub struct StorageData {
    version: u32,
    states: BTreeMap<String, ComponentState>,
}

impl StorageData {
    /// Create an empty snapshot at the given format version
    pub fn new(version: u32) -> Self {
        StorageData {
            version,
            states: BTreeMap::new(),
        }
    }

    /// Format version of this snapshot
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Number of components with state
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether the snapshot holds no state at all
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Component names in sorted order
    pub fn component_names(&self) -> impl Iterator<Item = &str> {
        self.states.keys().map(|k| k.as_str())
    }

    /// Stored state of one component
    pub fn get(&self, name: &str) -> Option<&ComponentState> {
        self.states.get(name)
    }

    /// Iterate stored states in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ComponentState)> {
        self.states.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Set a component's state; an empty state removes the entry
    ///
    /// Returns whether the snapshot changed.
    pub fn set_state(&mut self, name: &str, element: StateElement) -> bool {
        if element.is_empty() {
            return self.remove(name);
        }
        let state = ComponentState::new(element);
        match self.states.get(name) {
            Some(existing) if existing.matches(&state) => false,
            _ => {
                self.states.insert(name.to_string(), state);
                true
            }
        }
    }

    /// Remove a component's entry; returns whether it was present
    pub fn remove(&mut self, name: &str) -> bool {
        self.states.remove(name).is_some()
    }

    /// Copy-on-write convenience: clone this snapshot with one state changed
    pub fn with_state(&self, name: &str, element: StateElement) -> StorageData {
        let mut copy = self.clone();
        copy.set_state(name, element);
        copy
    }

    /// Names whose presence, absence or content differs between two
    /// snapshots
    ///
    /// `None` means the snapshots carry different format versions and are
    /// incomparable — the caller must treat every component as changed. The
    /// comparison is O(number of components): per-component it uses
    /// structural equality or the cached content fingerprint, never a
    /// content-sized scan of the whole storage.
    pub fn diff(&self, other: &StorageData) -> Option<BTreeSet<String>> {
        if self.version != other.version {
            return None;
        }
        let mut changed = BTreeSet::new();
        for name in self.states.keys() {
            if !other.states.contains_key(name) {
                changed.insert(name.clone());
            }
        }
        for (name, state) in &other.states {
            match self.states.get(name) {
                None => {
                    changed.insert(name.clone());
                }
                Some(old) if !old.matches(state) => {
                    changed.insert(name.clone());
                }
                Some(_) => {}
            }
        }
        Some(changed)
    }
}
