//! Error types for shelfsync-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::SubscriptionId;

/// All errors that can arise from the key/value storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failure, annotated with the path involved.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML serialization error (write path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load, with the document path.
    #[error("failed to parse store document at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The key exists but holds a different kind of value (hash vs. set).
    #[error("store key '{key}' holds a {actual}, expected a {expected}")]
    WrongType {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// A key that cannot be mapped onto the backing medium.
    #[error("invalid store key '{0}'")]
    InvalidKey(String),

    /// A stored field could not be decoded into its domain type.
    #[error("corrupt field '{field}' in '{key}': {reason}")]
    Corrupt {
        key: String,
        field: String,
        reason: String,
    },

    /// A blocking storage task panicked or was cancelled.
    #[error("storage task failed: {0}")]
    Join(String),
}

/// Errors surfaced by subscription construction, lookup and configuration.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed subscription input. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Referenced subscription id does not exist.
    #[error("subscription '{id}' not found")]
    NotFound { id: SubscriptionId },

    /// Storage failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Config file exists but could not be read or parsed.
    #[error("failed to load config at {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    /// `dirs::home_dir()` returned `None`, so `~/.shelfsync/` cannot be located.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}

/// Convenience constructor for [`StoreError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}
