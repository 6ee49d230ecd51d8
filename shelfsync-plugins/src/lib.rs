//! # shelfsync-plugins
//!
//! Output plugins replay a [`SyncSession`](shelfsync_core::SyncSession) to
//! some back-end. This crate holds the plugin contract, the registry that
//! validates and configures plugins per subscription, and the built-in
//! `logger` and `file` plugins.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use shelfsync_core::PluginBinding;
//! use shelfsync_plugins::PluginRegistry;
//!
//! fn configure() -> Result<(), shelfsync_plugins::PluginError> {
//!     let registry = PluginRegistry::with_builtins()?;
//!     let chain = registry.configure(&[
//!         PluginBinding::new("logger"),
//!         PluginBinding::new("file").with_option("directory", "/srv/library"),
//!     ])?;
//!     assert_eq!(chain.len(), 2);
//!     Ok(())
//! }
//! ```

pub mod builtin;
pub mod descriptor;
pub mod error;
pub mod plugin;
pub mod registry;

pub use descriptor::{Completion, PluginDescriptor};
pub use error::PluginError;
pub use plugin::{summarize, Parameter, Plugin, PluginInfo};
pub use registry::{ConfiguredPlugin, PluginRegistry};
