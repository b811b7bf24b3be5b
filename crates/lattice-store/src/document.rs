//! On-disk document codec
//!
//! A storage document is a root element named after the owner kind
//! ("application", "project", "module"), carrying a format `version` and the
//! stored components as generic `component` wrapper elements. Each wrapper
//! has the component's `name` as its first attribute and the serialized
//! state as nested content. Components are written in name-sorted order so
//! renders are deterministic and byte-comparable.
//!
//! Directory storages use the same wrapper shape per sub-file ("fragments")
//! so reload can reassemble sub-states into one logical state.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::data::StorageData;
use crate::element::StateElement;
use crate::error::{StoreError, StoreResult};

/// Current storage document format version
pub const CURRENT_FORMAT_VERSION: u32 = 2;

/// Tag of the generic component wrapper element
pub const COMPONENT_TAG: &str = "component";

const NAME_ATTRIBUTE: &str = "name";

/// Supported document formats, selected by file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    /// JSON format (.json)
    Json,
    /// YAML format (.yaml, .yml)
    Yaml,
}

impl DocumentFormat {
    /// Get the canonical file extension for this format
    pub fn extension(&self) -> &'static str {
        match self {
            DocumentFormat::Json => "json",
            DocumentFormat::Yaml => "yaml",
        }
    }

    /// Detect format from a file extension
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "json" => Some(DocumentFormat::Json),
            "yaml" | "yml" => Some(DocumentFormat::Yaml),
            _ => None,
        }
    }

    /// Detect format from a path's extension
    pub fn for_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }
}

/// One step of the legacy-format conversion chain
///
/// A converter upgrades documents at exactly `version()` to `version() + 1`.
/// Steps must be idempotent; the codec applies them in ascending version
/// order until the document is current.
pub trait StateConverter: Send + Sync {
    /// Document version this step upgrades from
    fn version(&self) -> u32;

    /// Transform the loaded component states in place
    fn convert(&self, components: &mut BTreeMap<String, StateElement>);
}

#[derive(Serialize, Deserialize)]
struct DocumentBody {
    #[serde(default = "current_version")]
    version: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    components: Vec<StateElement>,
}

fn current_version() -> u32 {
    CURRENT_FORMAT_VERSION
}

/// Reads and writes storage documents for one owner kind
pub struct DocumentCodec {
    root_tag: String,
    converters: Vec<Arc<dyn StateConverter>>,
}

impl DocumentCodec {
    /// Create a codec for the given owner root tag
    pub fn new(root_tag: impl Into<String>) -> Self {
        DocumentCodec {
            root_tag: root_tag.into(),
            converters: Vec::new(),
        }
    }

    /// Attach the legacy-format conversion chain, kept sorted by version
    pub fn with_converters(mut self, mut converters: Vec<Arc<dyn StateConverter>>) -> Self {
        converters.sort_by_key(|c| c.version());
        self.converters = converters;
        self
    }

    /// Owner root tag
    pub fn root_tag(&self) -> &str {
        &self.root_tag
    }

    /// Parse a storage document into a snapshot
    pub fn parse(
        &self,
        bytes: &[u8],
        format: DocumentFormat,
        path: &Path,
    ) -> StoreResult<StorageData> {
        let document: BTreeMap<String, DocumentBody> = match format {
            DocumentFormat::Json => serde_json::from_slice(bytes)
                .map_err(|e| StoreError::parse(path.to_path_buf(), "json", e.to_string()))?,
            DocumentFormat::Yaml => serde_yaml::from_slice(bytes)
                .map_err(|e| StoreError::parse(path.to_path_buf(), "yaml", e.to_string()))?,
        };

        let (root_tag, body) = match document.into_iter().next() {
            Some(entry) => entry,
            None => return Ok(StorageData::new(CURRENT_FORMAT_VERSION)),
        };
        if root_tag != self.root_tag {
            warn!(
                path = %path.display(),
                found = %root_tag,
                expected = %self.root_tag,
                "document root tag does not match owner kind, accepting content"
            );
        }

        let mut components = BTreeMap::new();
        for wrapper in body.components {
            let name = match wrapper.attribute(NAME_ATTRIBUTE) {
                Some(name) => name.to_string(),
                None => {
                    warn!(path = %path.display(), "component wrapper without name attribute, skipping");
                    continue;
                }
            };
            let state = match merge_substates(wrapper.children) {
                Some(state) => state,
                None => continue,
            };
            if components.contains_key(&name) {
                warn!(path = %path.display(), component = %name, "duplicate component entry, keeping first");
                continue;
            }
            components.insert(name, state);
        }

        let version = self.convert_to_current(body.version, &mut components, path);

        let mut data = StorageData::new(version);
        for (name, state) in components {
            data.set_state(&name, state);
        }
        Ok(data)
    }

    /// Render a snapshot into document bytes
    pub fn render(&self, data: &StorageData, format: DocumentFormat) -> StoreResult<Vec<u8>> {
        let components = data
            .iter()
            .map(|(name, state)| wrap_component(name, state.element().clone()))
            .collect();
        let body = DocumentBody {
            version: data.version(),
            components,
        };
        let mut document = BTreeMap::new();
        document.insert(self.root_tag.clone(), body);

        render_value(&document, format)
    }

    fn convert_to_current(
        &self,
        loaded: u32,
        components: &mut BTreeMap<String, StateElement>,
        path: &Path,
    ) -> u32 {
        if loaded > CURRENT_FORMAT_VERSION {
            warn!(
                path = %path.display(),
                version = loaded,
                current = CURRENT_FORMAT_VERSION,
                "document version is newer than this build, keeping as-is"
            );
            return loaded;
        }
        if loaded < CURRENT_FORMAT_VERSION {
            for converter in &self.converters {
                let v = converter.version();
                if v >= loaded && v < CURRENT_FORMAT_VERSION {
                    converter.convert(components);
                }
            }
        }
        CURRENT_FORMAT_VERSION
    }
}

/// Build the generic component wrapper with the name forced first
pub(crate) fn wrap_component(name: &str, state: StateElement) -> StateElement {
    StateElement {
        tag: COMPONENT_TAG.to_string(),
        attributes: vec![(NAME_ATTRIBUTE.to_string(), name.to_string())],
        text: None,
        children: vec![state],
    }
}

/// Reassemble sub-states (wrapper children, in file-name order for directory
/// storages) into one logical state
///
/// The first sub-state is the base; later ones contribute their children,
/// while attributes and text keep the first occurrence.
pub(crate) fn merge_substates(mut substates: Vec<StateElement>) -> Option<StateElement> {
    let mut merged = match substates.is_empty() {
        true => return None,
        false => substates.remove(0),
    };
    for sub in substates {
        for (name, value) in sub.attributes {
            if merged.attribute(&name).is_none() {
                merged.attributes.push((name, value));
            }
        }
        if merged.text.is_none() {
            merged.text = sub.text;
        }
        merged.children.extend(sub.children);
    }
    Some(merged)
}

/// Render one sub-state fragment for a directory storage file
pub(crate) fn render_fragment(
    name: &str,
    substate: StateElement,
    format: DocumentFormat,
) -> StoreResult<Vec<u8>> {
    render_value(&wrap_component(name, substate), format)
}

/// Parse one directory storage file back into its owning component name and
/// sub-states
pub(crate) fn parse_fragment(
    bytes: &[u8],
    format: DocumentFormat,
    path: &Path,
) -> StoreResult<(String, Vec<StateElement>)> {
    let wrapper: StateElement = match format {
        DocumentFormat::Json => serde_json::from_slice(bytes)
            .map_err(|e| StoreError::parse(path.to_path_buf(), "json", e.to_string()))?,
        DocumentFormat::Yaml => serde_yaml::from_slice(bytes)
            .map_err(|e| StoreError::parse(path.to_path_buf(), "yaml", e.to_string()))?,
    };
    let name = wrapper.attribute(NAME_ATTRIBUTE).ok_or_else(|| {
        StoreError::parse(
            path.to_path_buf(),
            format.extension(),
            "fragment without component name",
        )
    })?;
    Ok((name.to_string(), wrapper.children))
}

fn render_value<T: Serialize>(value: &T, format: DocumentFormat) -> StoreResult<Vec<u8>> {
    match format {
        DocumentFormat::Json => {
            let mut bytes = serde_json::to_vec_pretty(value)
                .map_err(|e| StoreError::internal(format!("render failed: {e}")))?;
            bytes.push(b'\n');
            Ok(bytes)
        }
        DocumentFormat::Yaml => serde_yaml::to_string(value)
            .map(String::into_bytes)
            .map_err(|e| StoreError::internal(format!("render failed: {e}"))),
    }
}
