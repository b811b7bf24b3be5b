//! Storage error types for Lattice

use std::path::PathBuf;
use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Store error types
#[derive(Error, Debug)]
pub enum StoreError {
    /// A path contained a macro token with no definition in the macro table
    #[error("Unknown macro {token} in {value}")]
    UnknownMacro { token: String, value: String },

    /// File read/write failed
    #[error("IO error on {path} ({operation}): {source}")]
    Io {
        path: PathBuf,
        operation: IoOperation,
        source: std::io::Error,
    },

    /// Document parsing failed
    #[error("Failed to parse {path} as {format}: {message}")]
    Parse {
        path: PathBuf,
        format: String,
        message: String,
    },

    /// File storage path has no extension the codec recognizes
    #[error("File storage path {path} has no recognized extension")]
    UnrecognizedExtension { path: PathBuf },

    /// A component's state could not be serialized
    #[error("Component {component} failed to serialize: {message}")]
    Serialization { component: String, message: String },

    /// No storage target could be resolved for a component
    #[error("No storage target resolved for component {component}")]
    NoStorageTarget { component: String },

    /// A critical storage file is truncated or corrupt; writes stay blocked
    /// until the file is corrected or removed
    #[error("Content of {path} is truncated or corrupt; correct it or it will be recreated")]
    TruncatedCritical { path: PathBuf },

    /// A save cycle finished with one or more failures; every individual
    /// cause is preserved
    #[error("Save cycle finished with {} failure(s): {}", .causes.len(), summarize(.causes))]
    SaveAggregate { causes: Vec<StoreError> },

    /// File watcher error
    #[error("File watcher error: {0}")]
    Watch(#[from] notify::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// IO operation type for error context
#[derive(Debug, Clone, Copy)]
pub enum IoOperation {
    Read,
    Write,
    Delete,
    CreateDir,
}

impl std::fmt::Display for IoOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoOperation::Read => write!(f, "read"),
            IoOperation::Write => write!(f, "write"),
            IoOperation::Delete => write!(f, "delete"),
            IoOperation::CreateDir => write!(f, "create dir"),
        }
    }
}

fn summarize(causes: &[StoreError]) -> String {
    causes
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl StoreError {
    /// Create an unknown-macro error
    pub fn unknown_macro(token: impl Into<String>, value: impl Into<String>) -> Self {
        StoreError::UnknownMacro {
            token: token.into(),
            value: value.into(),
        }
    }

    /// Create an IO error
    pub fn io(path: PathBuf, operation: IoOperation, source: std::io::Error) -> Self {
        StoreError::Io {
            path,
            operation,
            source,
        }
    }

    /// Create a parse error
    pub fn parse(path: PathBuf, format: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Parse {
            path,
            format: format.into(),
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(component: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Serialization {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create a no-storage-target error
    pub fn no_storage_target(component: impl Into<String>) -> Self {
        StoreError::NoStorageTarget {
            component: component.into(),
        }
    }

    /// Create an aggregate save error from the collected causes
    pub fn save_aggregate(causes: Vec<StoreError>) -> Self {
        StoreError::SaveAggregate { causes }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        StoreError::Internal(message.into())
    }

    /// Individual causes of an aggregate save failure, if this is one
    pub fn causes(&self) -> &[StoreError] {
        match self {
            StoreError::SaveAggregate { causes } => causes,
            _ => std::slice::from_ref(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_preserves_all_causes() {
        let err = StoreError::save_aggregate(vec![
            StoreError::serialization("editor", "boom"),
            StoreError::no_storage_target("vcs"),
        ]);

        assert_eq!(err.causes().len(), 2);
        let text = err.to_string();
        assert!(text.contains("2 failure(s)"));
        assert!(text.contains("editor"));
        assert!(text.contains("vcs"));
    }

    #[test]
    fn test_causes_of_plain_error_is_itself() {
        let err = StoreError::internal("oops");
        assert_eq!(err.causes().len(), 1);
    }
}
