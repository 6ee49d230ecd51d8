//! shelfsync daemon: controller, job queue, push-stream listener, and the
//! runtime that serves them over a Unix socket.

pub mod controller;
mod error;
pub mod listener;
pub mod lock;
pub mod paths;
pub mod protocol;
pub mod queue;
mod runtime;
pub mod transport;

pub use controller::{Controller, ControllerStatus, SyncRequest, JOB_TYPES};
pub use error::DaemonError;
pub use listener::{AddOutcome, Listener, ListenerConfig, ListenerEvent, ListenerStatus};
pub use lock::{LockGuard, LockTable};
pub use protocol::{
    request_list, request_status, request_stop, request_subscribe, request_sync,
    request_unsubscribe, send_request, DaemonRequest, DaemonResponse, SubscriptionSummary,
};
pub use queue::{Job, JobId, JobQueue, JobState, MemoryQueue, NewJob, QueueCounts};
pub use runtime::{init_tracing, open_engine, run, start_blocking};
pub use transport::{MemoryServer, MemoryTransport, Transport, WebSocketTransport};
