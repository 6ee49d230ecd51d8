//! Error types for shelfsync-sync.

use thiserror::Error;

use shelfsync_core::{CoreError, StoreError, SubscriptionId};
use shelfsync_plugins::PluginError;

/// All errors that can abort a sync attempt.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The remote library is permanently gone. Not retried.
    #[error("subscription '{id}' was removed remotely")]
    Removed { id: SubscriptionId },

    /// The remote reported a version older than the committed one.
    #[error("remote version {remote} of subscription '{id}' is behind committed version {stored}")]
    VersionRegressed {
        id: SubscriptionId,
        stored: u64,
        remote: u64,
    },

    /// Non-success HTTP status from the remote source.
    #[error("remote returned HTTP {status}: {message}")]
    Remote { status: u16, message: String },

    /// Transport-level failure talking to the remote source.
    #[error("HTTP transport error: {0}")]
    Http(String),

    /// Response body or headers the source could not interpret.
    #[error("malformed remote response: {0}")]
    Protocol(String),

    #[error("plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("subscription error: {0}")]
    Core(#[from] CoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A blocking request task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Join(String),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::Core(CoreError::Store(err))
    }
}

impl SyncError {
    pub fn is_removed(&self) -> bool {
        matches!(self, SyncError::Removed { .. })
    }
}
