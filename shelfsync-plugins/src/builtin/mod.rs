//! Built-in plugins shipped with the daemon.

mod file;
mod logger;

use std::sync::Arc;

use crate::plugin::Plugin;

pub use file::{FilePlugin, Manifest, WriteResult};
pub use logger::LoggerPlugin;

/// Every built-in plugin, ready for registration.
pub fn all() -> Vec<Arc<dyn Plugin>> {
    vec![Arc::new(LoggerPlugin::new()), Arc::new(FilePlugin::new())]
}
