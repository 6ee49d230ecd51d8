//! Plugin descriptors: the data-only way to define a plugin.
//!
//! A descriptor names a plugin, declares its parameters, and supplies a
//! process operation in one of two shapes:
//!
//! - [`PluginDescriptor::process`] takes an async closure returning a future.
//! - [`PluginDescriptor::process_with_callback`] takes a closure that is
//!   handed a [`Completion`] and must call [`Completion::done`] when finished.
//!
//! Both shapes are normalised into one awaitable [`Plugin`] by
//! [`PluginRegistry::add`](crate::PluginRegistry::add), so callers never see
//! the difference.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::oneshot;

use shelfsync_core::{PluginOptions, SyncSession};

use crate::error::PluginError;
use crate::plugin::{Parameter, Plugin};

type AsyncProcess =
    dyn Fn(SyncSession, PluginOptions) -> BoxFuture<'static, Result<(), PluginError>> + Send + Sync;
type CallbackProcess = dyn Fn(SyncSession, PluginOptions, Completion) + Send + Sync;

#[derive(Clone)]
pub(crate) enum Process {
    Async(Arc<AsyncProcess>),
    Callback(Arc<CallbackProcess>),
}

/// One-shot completion handle for callback-style plugins.
///
/// Consuming `self` makes a second signal impossible. Dropping the handle
/// without calling [`done`](Completion::done) fails the dispatch.
pub struct Completion {
    tx: oneshot::Sender<Result<(), String>>,
}

impl Completion {
    pub fn done(self, result: Result<(), String>) {
        // Receiver gone means the dispatcher was cancelled.
        let _ = self.tx.send(result);
    }

    pub fn ok(self) {
        self.done(Ok(()))
    }

    pub fn fail(self, message: impl Into<String>) {
        self.done(Err(message.into()))
    }
}

/// A plugin definition awaiting registration.
#[derive(Clone, Default)]
pub struct PluginDescriptor {
    pub(crate) name: Option<String>,
    pub(crate) description: Option<String>,
    pub(crate) parameters: Vec<Parameter>,
    pub(crate) process: Option<Process>,
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("parameters", &self.parameters)
            .field("process", &self.process.as_ref().map(|p| match p {
                Process::Async(_) => "async",
                Process::Callback(_) => "callback",
            }))
            .finish()
    }
}

impl PluginDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::new().name(name)
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Future-returning process operation.
    pub fn process<F>(mut self, f: F) -> Self
    where
        F: Fn(SyncSession, PluginOptions) -> BoxFuture<'static, Result<(), PluginError>>
            + Send
            + Sync
            + 'static,
    {
        self.process = Some(Process::Async(Arc::new(f)));
        self
    }

    /// Completion-callback process operation.
    pub fn process_with_callback<F>(mut self, f: F) -> Self
    where
        F: Fn(SyncSession, PluginOptions, Completion) + Send + Sync + 'static,
    {
        self.process = Some(Process::Callback(Arc::new(f)));
        self
    }

    /// Check the descriptor and turn it into a plugin.
    pub(crate) fn build(self) -> Result<FnPlugin, PluginError> {
        let name = match self.name {
            Some(name) if !name.trim().is_empty() => name,
            _ => {
                return Err(PluginError::Validation(
                    "plugin descriptor has no name".to_string(),
                ))
            }
        };
        let Some(process) = self.process else {
            return Err(PluginError::Validation(format!(
                "plugin '{name}' has no process operation"
            )));
        };
        Ok(FnPlugin {
            name,
            description: self.description,
            parameters: self.parameters,
            process,
        })
    }
}

/// A plugin backed by closures from a [`PluginDescriptor`].
pub(crate) struct FnPlugin {
    name: String,
    description: Option<String>,
    parameters: Vec<Parameter>,
    process: Process,
}

#[async_trait]
impl Plugin for FnPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    async fn process(
        &self,
        session: &SyncSession,
        options: &PluginOptions,
    ) -> Result<(), PluginError> {
        match &self.process {
            Process::Async(f) => f(session.clone(), options.clone()).await,
            Process::Callback(f) => {
                let (tx, rx) = oneshot::channel();
                f(session.clone(), options.clone(), Completion { tx });
                match rx.await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(message)) => Err(PluginError::failed(&self.name, message)),
                    Err(_) => Err(PluginError::failed(
                        &self.name,
                        "completion dropped without a result",
                    )),
                }
            }
        }
    }
}
