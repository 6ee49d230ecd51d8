pub mod daemon;
pub mod list;
pub mod plugins;
pub mod subscribe;
pub mod sync;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use shelfsync_core::Config;
use shelfsync_daemon::{open_engine, Controller, MemoryQueue};

pub(crate) fn home() -> Result<PathBuf> {
    shelfsync_core::config::home().context("could not determine home directory")
}

/// Run `f` against a controller of our own when no daemon is running.
///
/// Jobs it enqueues are kept in memory only; the listener and periodic
/// resync stay off.
pub(crate) fn offline<T, F, Fut>(home: &Path, f: F) -> Result<T>
where
    F: FnOnce(Controller) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    runtime.block_on(async {
        let config = Config::load_at(home).context("failed to load config")?;
        let config = Config {
            live: false,
            resync_interval_secs: None,
            ..config
        };
        let engine = open_engine(home).context("failed to open subscription store")?;
        let controller = Controller::new(engine, Arc::new(MemoryQueue::new()), config);

        let result = f(controller.clone()).await;
        controller
            .stop()
            .await
            .context("failed to close subscription store")?;
        result
    })
}
