//! Error types for shelfsync-plugins.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from plugin registration, configuration and
/// processing.
#[derive(Debug, Error)]
pub enum PluginError {
    /// A descriptor is missing its name or process operation, or declares an
    /// unusable parameter.
    #[error("invalid plugin descriptor: {0}")]
    Validation(String),

    /// Missing mandatory parameter or a value rejected by its pattern.
    #[error("plugin '{plugin}' parameter '{parameter}': {reason}")]
    Configuration {
        plugin: String,
        parameter: String,
        reason: String,
    },

    /// A binding names a plugin that was never registered.
    #[error("unknown plugin '{0}'")]
    Unknown(String),

    /// `process` rejected.
    #[error("plugin '{plugin}' failed: {message}")]
    Failed { plugin: String, message: String },

    /// Filesystem failure inside a plugin, with annotated path.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PluginError {
    pub fn failed(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        PluginError::Failed {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// True for errors that must block subscription creation.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            PluginError::Configuration { .. } | PluginError::Unknown(_)
        )
    }
}

/// Convenience constructor for [`PluginError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> PluginError {
    PluginError::Io {
        path: path.into(),
        source,
    }
}
