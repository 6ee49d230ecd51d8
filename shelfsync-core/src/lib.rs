//! shelfsync core library — subscription model, storage, configuration.
//!
//! Public API surface:
//! - [`types`] — newtypes and domain structs ([`Subscription`], [`PluginBinding`], [`RetryPolicy`])
//! - [`session`] — the ephemeral [`SyncSession`] handed to plugins
//! - [`store`] — the key/value storage contract plus [`MemoryStore`]
//! - [`file_store`] — YAML-on-disk [`FileStore`]
//! - [`repo`] — [`SubscriptionRepo`], the subscription persistence layout
//! - [`config`] — daemon configuration file
//! - [`error`] — [`StoreError`], [`CoreError`]

pub mod config;
pub mod error;
pub mod file_store;
pub mod repo;
pub mod session;
pub mod store;
pub mod types;

pub use config::Config;
pub use error::{CoreError, StoreError};
pub use file_store::FileStore;
pub use repo::SubscriptionRepo;
pub use session::SyncSession;
pub use store::{Fields, MemoryStore, Store};
pub use types::{
    Backoff, PluginBinding, PluginOptions, RetryPolicy, Subscription, SubscriptionId,
    SubscriptionInput,
};
