//! Storage manager and path resolution
//!
//! One [`StorageManager`] per owner resolves storage targets to live
//! [`Storage`] instances: it expands the target's path macros, caches
//! storages by the expanded key, and picks the strategy — file-based unless
//! the target declares a splitter, in which case directory-based. It also
//! mediates the two-phase save protocol by opening externalization sessions.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::component::StorageTarget;
use crate::document::{DocumentCodec, DocumentFormat, StateConverter};
use crate::error::{StoreError, StoreResult};
use crate::macros::PathMacros;
use crate::session::ExternalizationSession;
use crate::storage::{DirectoryStorage, FileStorage, StateSplitter, Storage};

/// Resolves storage targets and caches the resulting storages by key
pub struct StorageManager {
    macros: Arc<PathMacros>,
    codec: Arc<DocumentCodec>,
    default_format: DocumentFormat,
    splitters: HashMap<String, Arc<dyn StateSplitter>>,
    storages: Mutex<HashMap<String, Arc<dyn Storage>>>,
    headless: bool,
}

impl StorageManager {
    /// Create a manager for one owner kind
    pub fn new(root_tag: impl Into<String>, macros: Arc<PathMacros>) -> Self {
        StorageManager {
            macros,
            codec: Arc::new(DocumentCodec::new(root_tag)),
            default_format: DocumentFormat::Json,
            splitters: HashMap::new(),
            storages: Mutex::new(HashMap::new()),
            headless: false,
        }
    }

    /// Attach the legacy-format conversion chain
    pub fn with_converters(mut self, converters: Vec<Arc<dyn StateConverter>>) -> Self {
        let root_tag = self.codec.root_tag().to_string();
        self.codec = Arc::new(DocumentCodec::new(root_tag).with_converters(converters));
        self
    }

    /// Register a splitter under its identifier
    pub fn with_splitter(
        mut self,
        id: impl Into<String>,
        splitter: Arc<dyn StateSplitter>,
    ) -> Self {
        self.splitters.insert(id.into(), splitter);
        self
    }

    /// Allow extension-less file storage paths (unit-test mode)
    pub fn headless(mut self) -> Self {
        self.headless = true;
        self
    }

    /// The shared macro substitution of this owner
    pub fn macros(&self) -> &Arc<PathMacros> {
        &self.macros
    }

    /// Root tag this manager's documents are written with
    pub fn root_tag(&self) -> &str {
        self.codec.root_tag()
    }

    /// Resolve a target to its storage, constructing and caching on first
    /// access
    ///
    /// The cache lookup and insert happen under one lock, so concurrent
    /// calls for the same key always return the same instance.
    pub fn resolve(&self, target: &StorageTarget) -> StoreResult<Arc<dyn Storage>> {
        let key = self.macros.expand(&target.path)?;
        let mut storages = self.storages.lock();
        if let Some(storage) = storages.get(&key) {
            return Ok(storage.clone());
        }
        let storage = self.create_storage(&key, target)?;
        debug!(key = %key, roaming = ?target.roaming, "storage created");
        storages.insert(key, storage.clone());
        Ok(storage)
    }

    /// Evict a cached storage, e.g. when a component's file path changes at
    /// runtime
    pub fn clear_storage(&self, key: &str) -> bool {
        self.storages.lock().remove(key).is_some()
    }

    /// A cached storage by key, if present
    pub fn cached_storage(&self, key: &str) -> Option<Arc<dyn Storage>> {
        self.storages.lock().get(key).cloned()
    }

    /// All storages resolved so far
    pub fn cached_storages(&self) -> Vec<Arc<dyn Storage>> {
        self.storages.lock().values().cloned().collect()
    }

    /// Begin a save cycle
    pub fn start_externalization(self: &Arc<Self>) -> ExternalizationSession {
        ExternalizationSession::new(self.clone())
    }

    /// Expand every macro in a path; fails on an unknown macro
    pub fn expand_macros(&self, path: &str) -> StoreResult<String> {
        self.macros.expand(path)
    }

    /// Collapse known macro expansions in a path; never fails
    pub fn collapse_macros(&self, path: &str) -> String {
        self.macros.collapse(path)
    }

    fn create_storage(&self, key: &str, target: &StorageTarget) -> StoreResult<Arc<dyn Storage>> {
        let path = PathBuf::from(key);
        if let Some(id) = &target.splitter {
            let splitter = self.splitters.get(id).ok_or_else(|| {
                StoreError::internal(format!("no splitter registered under id {id}"))
            })?;
            return Ok(Arc::new(DirectoryStorage::new(
                key.to_string(),
                path,
                self.default_format,
                splitter.clone(),
                self.macros.clone(),
            )));
        }

        let format = match DocumentFormat::for_path(&path) {
            Some(format) => format,
            None if self.headless => self.default_format,
            None => return Err(StoreError::UnrecognizedExtension { path }),
        };
        Ok(Arc::new(FileStorage::new(
            key.to_string(),
            path,
            format,
            self.codec.clone(),
            self.macros.clone(),
            target.critical,
        )))
    }
}
