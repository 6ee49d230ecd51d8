use std::path::PathBuf;

use thiserror::Error;

use shelfsync_core::{CoreError, StoreError};
use shelfsync_plugins::PluginError;
use shelfsync_sync::SyncError;

/// Error surface for the controller, job queue, listener, and socket protocol.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Core(#[from] CoreError),

    #[error("{0}")]
    Plugin(#[from] PluginError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown job type '{0}'")]
    UnknownJobType(String),

    #[error("invalid job payload: {0}")]
    Payload(String),

    #[error("job queue error: {0}")]
    Queue(String),

    #[error("stream transport error: {0}")]
    Transport(String),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("{component} did not stop within the shutdown timeout ({pending} unfinished)")]
    ShutdownTimeout {
        component: &'static str,
        pending: usize,
    },

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    #[error("daemon is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },
}

impl From<StoreError> for DaemonError {
    fn from(err: StoreError) -> Self {
        DaemonError::Core(CoreError::Store(err))
    }
}

impl DaemonError {
    /// Whether a job failing with this error should go back through the
    /// queue's retry policy.
    ///
    /// Malformed input, missing subscriptions and unknown job types fail
    /// immediately.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            DaemonError::UnknownJobType(_)
                | DaemonError::Payload(_)
                | DaemonError::Core(CoreError::Validation(_) | CoreError::NotFound { .. })
                | DaemonError::Plugin(_)
        )
    }
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
