//! Serialized component state trees
//!
//! A [`StateElement`] is the opaque unit of serialized state a component
//! hands to the store and receives back on load: a tagged node with
//! insertion-ordered attributes, optional text and child elements. The store
//! never interprets the content beyond structural equality, emptiness and a
//! content fingerprint.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One node of a serialized state tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateElement {
    /// Element tag
    pub tag: String,
    /// Attributes in insertion order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<(String, String)>,
    /// Text content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Child elements in document order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<StateElement>,
}

impl StateElement {
    /// Create an element with the given tag and no content
    pub fn new(tag: impl Into<String>) -> Self {
        StateElement {
            tag: tag.into(),
            attributes: Vec::new(),
            text: None,
            children: Vec::new(),
        }
    }

    /// Builder-style attribute append
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attribute(name, value);
        self
    }

    /// Builder-style text content
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Builder-style child append
    pub fn with_child(mut self, child: StateElement) -> Self {
        self.children.push(child);
        self
    }

    /// Look up an attribute value by name
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Set an attribute, replacing an existing one in place or appending
    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((name, value)),
        }
    }

    /// Remove an attribute, returning its previous value
    pub fn remove_attribute(&mut self, name: &str) -> Option<String> {
        let index = self.attributes.iter().position(|(n, _)| n == name)?;
        Some(self.attributes.remove(index).1)
    }

    /// First child with the given tag
    pub fn child(&self, tag: &str) -> Option<&StateElement> {
        self.children.iter().find(|c| c.tag == tag)
    }

    /// An element with no attributes, no text and no children carries no
    /// state; storing it is equivalent to removal
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty() && self.text.is_none() && self.children.is_empty()
    }

    /// Content fingerprint over the canonical JSON rendering
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        // canonical rendering is deterministic: struct field order plus
        // insertion-ordered attribute and child vectors
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hasher.update(&bytes);
        hasher.finalize().into()
    }

    /// Visit every attribute value and the text of this element and all
    /// descendants, mutably
    pub fn visit_values_mut<F: FnMut(&mut String)>(&mut self, f: &mut F) {
        for (_, value) in &mut self.attributes {
            f(value);
        }
        if let Some(text) = &mut self.text {
            f(text);
        }
        for child in &mut self.children {
            child.visit_values_mut(f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_element() {
        assert!(StateElement::new("state").is_empty());
        assert!(!StateElement::new("state").with_attribute("a", "1").is_empty());
        assert!(!StateElement::new("state").with_text("x").is_empty());
        assert!(!StateElement::new("state")
            .with_child(StateElement::new("entry"))
            .is_empty());
    }

    #[test]
    fn test_set_attribute_replaces_in_place() {
        let mut el = StateElement::new("state")
            .with_attribute("first", "1")
            .with_attribute("second", "2");

        el.set_attribute("first", "changed");

        assert_eq!(el.attribute("first"), Some("changed"));
        assert_eq!(el.attributes[0].0, "first");
        assert_eq!(el.attributes.len(), 2);
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = StateElement::new("state").with_attribute("k", "v");
        let b = StateElement::new("state").with_attribute("k", "v");
        let c = StateElement::new("state").with_attribute("k", "other");

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_visit_values_mut_reaches_descendants() {
        let mut el = StateElement::new("state")
            .with_attribute("path", "a")
            .with_child(StateElement::new("entry").with_text("b"));

        el.visit_values_mut(&mut |v| *v = format!("{v}!"));

        assert_eq!(el.attribute("path"), Some("a!"));
        assert_eq!(el.children[0].text.as_deref(), Some("b!"));
    }
}
