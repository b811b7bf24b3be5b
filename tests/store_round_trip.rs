//! Integration tests for the save/load round trip
//!
//! For any set of components with non-empty state, `save()` followed by a
//! fresh `load()` on an empty store reproduces the same set of component
//! names and structurally equal states. Read-only targets are deferred, not
//! fatal, and empty states delete their entries and backing files.

use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;

use lattice_store::{
    ComponentStore, MacroTable, NullListener, PathMacros, PersistenceSpec, PersistentComponent,
    StateElement, StorageManager, StorageTarget, StorePolicy, StoreResult,
};

struct RecordingComponent {
    state: Mutex<Option<StateElement>>,
}

impl RecordingComponent {
    fn with_state(state: StateElement) -> Arc<Self> {
        Arc::new(RecordingComponent {
            state: Mutex::new(Some(state)),
        })
    }

    fn empty() -> Arc<Self> {
        Arc::new(RecordingComponent {
            state: Mutex::new(None),
        })
    }

    fn current(&self) -> Option<StateElement> {
        self.state.lock().clone()
    }
}

impl PersistentComponent for RecordingComponent {
    fn serialize_state(&self) -> StoreResult<Option<StateElement>> {
        Ok(self.state.lock().clone())
    }

    fn load_state(&self, state: StateElement) {
        *self.state.lock() = Some(state);
    }
}

fn new_store(dir: &TempDir) -> ComponentStore {
    let mut table = MacroTable::new();
    table.define("ROOT", dir.path().to_string_lossy());
    let manager = Arc::new(StorageManager::new(
        "project",
        Arc::new(PathMacros::new(table)),
    ));
    ComponentStore::new(StorePolicy::project(), manager, Arc::new(NullListener))
}

fn editor_state() -> StateElement {
    StateElement::new("editor-settings")
        .with_attribute("theme", "dark")
        .with_attribute("directory", "/work/demo/src")
        .with_child(
            StateElement::new("option")
                .with_attribute("name", "tab-width")
                .with_attribute("value", "4"),
        )
}

fn vcs_state() -> StateElement {
    StateElement::new("vcs-settings")
        .with_attribute("backend", "git")
        .with_child(StateElement::new("root").with_text("/work/demo"))
}

#[test]
fn round_trip_reproduces_names_and_states() {
    let dir = TempDir::new().expect("temp dir");

    let store = new_store(&dir);
    let editor = RecordingComponent::with_state(editor_state());
    let vcs = RecordingComponent::with_state(vcs_state());
    store
        .register_component(
            PersistenceSpec::new("EditorSettings", StorageTarget::new("$ROOT$/workspace.json")),
            editor,
        )
        .expect("register");
    store
        .register_component(
            PersistenceSpec::new("VcsManager", StorageTarget::new("$ROOT$/workspace.json")),
            vcs,
        )
        .expect("register");

    let mut readonly = Vec::new();
    store.save(&mut readonly).expect("save");
    assert!(readonly.is_empty());

    // a brand new store over the same location
    let fresh = new_store(&dir);
    let editor = RecordingComponent::empty();
    let vcs = RecordingComponent::empty();
    fresh
        .register_component(
            PersistenceSpec::new("EditorSettings", StorageTarget::new("$ROOT$/workspace.json")),
            editor.clone(),
        )
        .expect("register");
    fresh
        .register_component(
            PersistenceSpec::new("VcsManager", StorageTarget::new("$ROOT$/workspace.json")),
            vcs.clone(),
        )
        .expect("register");
    fresh.load().expect("load");

    assert_eq!(editor.current(), Some(editor_state()));
    assert_eq!(vcs.current(), Some(vcs_state()));
}

#[test]
fn round_trip_survives_macro_collapse() {
    let dir = TempDir::new().expect("temp dir");

    // a state value under $ROOT$ is collapsed on write and expanded on load
    let store = new_store(&dir);
    let nested = dir.path().join("src").to_string_lossy().into_owned();
    let state = StateElement::new("paths").with_attribute("source-root", &nested);
    let component = RecordingComponent::with_state(state.clone());
    store
        .register_component(
            PersistenceSpec::new("PathSettings", StorageTarget::new("$ROOT$/paths.json")),
            component,
        )
        .expect("register");
    let mut readonly = Vec::new();
    store.save(&mut readonly).expect("save");

    let raw = std::fs::read_to_string(dir.path().join("paths.json")).expect("read");
    assert!(raw.contains("$ROOT$/src"), "on-disk form is macro-collapsed");
    assert!(!raw.contains(&nested), "absolute path does not leak to disk");

    let fresh = new_store(&dir);
    let component = RecordingComponent::empty();
    fresh
        .register_component(
            PersistenceSpec::new("PathSettings", StorageTarget::new("$ROOT$/paths.json")),
            component.clone(),
        )
        .expect("register");
    fresh.load().expect("load");

    assert_eq!(component.current(), Some(state));
}

#[test]
fn readonly_target_is_isolated_from_other_storages() {
    let dir = TempDir::new().expect("temp dir");

    let store = new_store(&dir);
    let first = RecordingComponent::with_state(editor_state());
    let second = RecordingComponent::with_state(vcs_state());
    let third = RecordingComponent::with_state(editor_state());
    store
        .register_component(
            PersistenceSpec::new("First", StorageTarget::new("$ROOT$/s1.json")),
            first,
        )
        .expect("register");
    store
        .register_component(
            PersistenceSpec::new("Second", StorageTarget::new("$ROOT$/s2.json")),
            second,
        )
        .expect("register");
    store
        .register_component(
            PersistenceSpec::new("Third", StorageTarget::new("$ROOT$/s3.json")),
            third,
        )
        .expect("register");

    // seed s2 and make it read-only
    std::fs::write(dir.path().join("s2.json"), b"{}").expect("seed");
    let mut perms = std::fs::metadata(dir.path().join("s2.json"))
        .expect("meta")
        .permissions();
    perms.set_readonly(true);
    std::fs::set_permissions(dir.path().join("s2.json"), perms).expect("set perms");

    let mut readonly = Vec::new();
    store.save(&mut readonly).expect("no aggregate error");

    assert!(dir.path().join("s1.json").exists());
    assert!(dir.path().join("s3.json").exists());
    assert_eq!(readonly.len(), 1);
    assert!(readonly[0].path.ends_with("s2.json"));

    let mut perms = std::fs::metadata(dir.path().join("s2.json"))
        .expect("meta")
        .permissions();
    perms.set_readonly(false);
    std::fs::set_permissions(dir.path().join("s2.json"), perms).expect("restore perms");
}

#[test]
fn emptied_state_removes_entry_and_file() {
    let dir = TempDir::new().expect("temp dir");

    let store = new_store(&dir);
    let keeper = RecordingComponent::with_state(editor_state());
    let emptier = RecordingComponent::with_state(vcs_state());
    store
        .register_component(
            PersistenceSpec::new("Keeper", StorageTarget::new("$ROOT$/shared.json")),
            keeper,
        )
        .expect("register");
    store
        .register_component(
            PersistenceSpec::new("Emptier", StorageTarget::new("$ROOT$/shared.json")),
            emptier.clone(),
        )
        .expect("register");

    let mut readonly = Vec::new();
    store.save(&mut readonly).expect("save");
    let raw = std::fs::read_to_string(dir.path().join("shared.json")).expect("read");
    assert!(raw.contains("Emptier"));

    // emptying one component removes its entry but keeps the file
    *emptier.state.lock() = Some(StateElement::new("vcs-settings"));
    store.save(&mut readonly).expect("save");
    let raw = std::fs::read_to_string(dir.path().join("shared.json")).expect("read");
    assert!(!raw.contains("Emptier"));
    assert!(raw.contains("Keeper"));
}
