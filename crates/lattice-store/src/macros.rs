//! Path macro substitution
//!
//! Storage paths and path-valued state are kept portable by substituting
//! `$NAME$` macros in and out. Expansion of a storage path is strict: every
//! token must resolve or the operation fails. Collapsing is best-effort and
//! never fails. Substitution inside a component's state tree is lenient —
//! unresolved tokens are left literal and tracked per component so they can
//! be surfaced as a warning later.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use parking_lot::{Mutex, RwLock};
use regex::Regex;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::element::StateElement;

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$([A-Za-z0-9_]+)\$").expect("valid macro token pattern"))
}

/// Insertion-ordered mapping of macro name to expansion
///
/// Collapse tries macros in registration order, so callers that want a
/// deterministic collapse must register the most specific expansions first.
#[derive(Debug, Clone, Default)]
pub struct MacroTable {
    entries: Vec<(String, String)>,
}

impl MacroTable {
    /// Create an empty table
    pub fn new() -> Self {
        MacroTable::default()
    }

    /// Create a table pre-populated with the standard machine macros
    /// (`$HOME$` and `$APP_CONFIG$`)
    pub fn with_standard_macros() -> StoreResult<Self> {
        let mut table = MacroTable::new();
        if let Some(config) = dirs::config_dir() {
            table.define("APP_CONFIG", config.to_string_lossy());
        }
        match dirs::home_dir() {
            Some(home) => table.define("HOME", home.to_string_lossy()),
            None => {
                return Err(StoreError::internal(
                    "could not determine home directory for $HOME$",
                ))
            }
        }
        Ok(table)
    }

    /// Define a macro, replacing an existing definition in place
    pub fn define(&mut self, name: impl Into<String>, expansion: impl Into<String>) {
        let name = name.into();
        let expansion = expansion.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = expansion,
            None => self.entries.push((name, expansion)),
        }
    }

    /// Look up the expansion of a macro
    pub fn expansion(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, e)| e.as_str())
    }

    /// Registered macro names in insertion order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    /// Expand every `$NAME$` token in `value`
    ///
    /// Fails on the first token without a definition; no partial expansion
    /// is ever returned.
    pub fn expand(&self, value: &str) -> StoreResult<String> {
        let mut result = String::with_capacity(value.len());
        let mut last = 0;
        for m in token_pattern().find_iter(value) {
            let name = &value[m.start() + 1..m.end() - 1];
            let expansion = self
                .expansion(name)
                .ok_or_else(|| StoreError::unknown_macro(m.as_str(), value))?;
            result.push_str(&value[last..m.start()]);
            result.push_str(expansion);
            last = m.end();
        }
        result.push_str(&value[last..]);
        Ok(result)
    }

    /// Expand tokens leniently, leaving unknown ones literal and recording
    /// their names in `unresolved`
    pub fn expand_lenient(&self, value: &str, unresolved: &mut BTreeSet<String>) -> String {
        let mut result = String::with_capacity(value.len());
        let mut last = 0;
        for m in token_pattern().find_iter(value) {
            let name = &value[m.start() + 1..m.end() - 1];
            result.push_str(&value[last..m.start()]);
            match self.expansion(name) {
                Some(expansion) => result.push_str(expansion),
                None => {
                    unresolved.insert(name.to_string());
                    result.push_str(m.as_str());
                }
            }
            last = m.end();
        }
        result.push_str(&value[last..]);
        result
    }

    /// Collapse known expansions back into `$NAME$` form
    ///
    /// Macros are tried in insertion order and a value with no matching
    /// expansion is returned unchanged. When one macro's expansion is a
    /// substring of another's, the collapse of an expanded path is only the
    /// inverse of expansion if the more specific macro was registered first.
    pub fn collapse(&self, value: &str) -> String {
        let mut result = value.to_string();
        for (name, expansion) in &self.entries {
            if expansion.is_empty() {
                continue;
            }
            if result.contains(expansion.as_str()) {
                result = result.replace(expansion.as_str(), &format!("${name}$"));
            }
        }
        result
    }
}

/// Shared, tracked macro substitution over paths and state trees
///
/// One instance per owner; storages and the component store share it. On top
/// of [`MacroTable`] it rewrites path-valued strings inside serialized state
/// in both directions and accumulates, per component, the macros it could
/// not resolve. Tracking is additive across loads and is reset whenever a
/// macro is newly defined.
pub struct PathMacros {
    table: RwLock<MacroTable>,
    unresolved: Mutex<BTreeMap<String, BTreeSet<String>>>,
}

impl PathMacros {
    /// Wrap a macro table for shared use
    pub fn new(table: MacroTable) -> Self {
        PathMacros {
            table: RwLock::new(table),
            unresolved: Mutex::new(BTreeMap::new()),
        }
    }

    /// Define a macro and reset unresolved-macro tracking, since previously
    /// unresolvable values may now resolve
    pub fn define(&self, name: impl Into<String>, expansion: impl Into<String>) {
        let name = name.into();
        debug!(macro_name = %name, "macro defined, resetting unresolved tracking");
        self.table.write().define(name, expansion);
        self.unresolved.lock().clear();
    }

    /// Strict expansion of a storage path
    pub fn expand(&self, value: &str) -> StoreResult<String> {
        self.table.read().expand(value)
    }

    /// Best-effort collapse of a path
    pub fn collapse(&self, value: &str) -> String {
        self.table.read().collapse(value)
    }

    /// Expand path-valued content inside a component's state tree, tracking
    /// unresolved macros under the component's name
    pub fn expand_element(&self, component: &str, element: &mut StateElement) {
        let table = self.table.read();
        let mut unknown = BTreeSet::new();
        element.visit_values_mut(&mut |value| {
            if value.contains('$') {
                *value = table.expand_lenient(value, &mut unknown);
            }
        });
        if !unknown.is_empty() {
            debug!(component, macros = ?unknown, "unresolved macros in component state");
            self.unresolved
                .lock()
                .entry(component.to_string())
                .or_default()
                .extend(unknown);
        }
    }

    /// Collapse path-valued content inside a component's state tree
    pub fn collapse_element(&self, element: &mut StateElement) {
        let table = self.table.read();
        element.visit_values_mut(&mut |value| {
            let collapsed = table.collapse(value);
            if collapsed != *value {
                *value = collapsed;
            }
        });
    }

    /// Macros that could not be resolved, per component, since the last
    /// reset
    pub fn unresolved(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.unresolved.lock().clone()
    }

    /// Unresolved macros recorded for one component
    pub fn unresolved_for(&self, component: &str) -> BTreeSet<String> {
        self.unresolved
            .lock()
            .get(component)
            .cloned()
            .unwrap_or_default()
    }
}
