//! # shelfsync-sync
//!
//! Computes what changed in a subscription's remote library since its last
//! committed version and replays the diff through its plugin chain.
//!
//! Call [`SyncEngine::sync`] once per attempt. The remote side is abstracted
//! behind [`RemoteSource`]; [`HttpSource`] is the production implementation.

pub mod classify;
pub mod engine;
pub mod error;
pub mod http;
pub mod source;

pub use classify::classify;
pub use engine::SyncEngine;
pub use error::SyncError;
pub use http::HttpSource;
pub use source::{ChangeSet, MemorySource, RemoteEntry, RemoteSource};
