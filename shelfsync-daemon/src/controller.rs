//! The controller: the daemon's single owner of subscription lifecycles.
//!
//! It ties the repository, the [`SyncEngine`], the [`JobQueue`] and the
//! optional [`Listener`] together. Everything the daemon does to a
//! subscription goes through one of its operations:
//!
//! - [`Controller::subscribe`] / [`Controller::unsubscribe`]
//! - [`Controller::synchronize`], guarded by the per-id [`LockTable`]
//! - [`Controller::notify`] to enqueue work, [`Controller::process`] to run it
//! - [`Controller::start`] / [`Controller::stop`]
//!
//! Listener events reach the controller over a channel; an `updated` event
//! only ever becomes a `sync` job.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use shelfsync_core::{Config, Subscription, SubscriptionId, SubscriptionInput, SubscriptionRepo, SyncSession};
use shelfsync_sync::SyncEngine;

use crate::error::DaemonError;
use crate::listener::{Listener, ListenerConfig, ListenerEvent, ListenerStatus};
use crate::lock::LockTable;
use crate::queue::{Job, JobHandler, JobQueue, NewJob, QueueCounts};
use crate::transport::Transport;

pub const JOB_SUBSCRIBE: &str = "subscribe";
pub const JOB_UNSUBSCRIBE: &str = "unsubscribe";
pub const JOB_SYNC: &str = "sync";
/// Job types consumed when [`Controller::start`] is given none.
pub const JOB_TYPES: [&str; 3] = [JOB_SUBSCRIBE, JOB_UNSUBSCRIBE, JOB_SYNC];

/// Payload of a `sync` job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<SubscriptionId>,
    #[serde(default)]
    pub all: bool,
    #[serde(default)]
    pub skip: bool,
}

impl SyncRequest {
    pub fn one(id: impl Into<SubscriptionId>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn all() -> Self {
        Self {
            all: true,
            ..Self::default()
        }
    }

    pub fn skip(mut self, skip: bool) -> Self {
        self.skip = skip;
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
struct UnsubscribeRequest {
    id: SubscriptionId,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub subscriptions: usize,
    pub syncing: usize,
    pub jobs: QueueCounts,
    pub live: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listener: Option<ListenerStatus>,
}

#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

struct Inner {
    engine: SyncEngine,
    queue: Arc<dyn JobQueue>,
    config: Config,
    locks: LockTable,
    transport: Mutex<Option<Box<dyn Transport>>>,
    listener: OnceLock<Listener>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: broadcast::Sender<()>,
    started: AtomicBool,
}

impl Controller {
    pub fn new(engine: SyncEngine, queue: Arc<dyn JobQueue>, config: Config) -> Self {
        let (shutdown, _) = broadcast::channel(4);
        Self {
            inner: Arc::new(Inner {
                engine,
                queue,
                config: config.normalized(),
                locks: LockTable::new(),
                transport: Mutex::new(None),
                listener: OnceLock::new(),
                tasks: Mutex::new(Vec::new()),
                shutdown,
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Stream transport the listener uses in live mode.
    pub fn with_transport(self, transport: Box<dyn Transport>) -> Self {
        *self
            .inner
            .transport
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(transport);
        self
    }

    pub fn repo(&self) -> &SubscriptionRepo {
        self.inner.engine.repo()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn locks(&self) -> &LockTable {
        &self.inner.locks
    }

    fn live(&self) -> Option<&Listener> {
        if self.inner.config.live {
            self.inner.listener.get()
        } else {
            None
        }
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Validate, persist and schedule a first sync.
    ///
    /// Plugin configuration is checked before anything is written. Subscribing
    /// again to an existing id replaces its URL, key and plugins; the save
    /// leaves the committed version alone, so it is safe next to a sync that
    /// holds the lock for that id.
    pub async fn subscribe(&self, input: SubscriptionInput) -> Result<Subscription, DaemonError> {
        let subscription = Subscription::from_input(input)?;
        self.inner
            .engine
            .plugins()
            .configure(&subscription.plugins)?;

        let repo = self.repo();
        repo.save(&subscription).await?;
        let subscription = repo.load(&subscription.id).await?;
        tracing::info!(
            subscription = %subscription.id,
            url = %subscription.url,
            plugins = subscription.plugins.len(),
            "subscribed"
        );

        self.notify_sync(SyncRequest::one(subscription.id.clone()), Some(Duration::ZERO))
            .await?;

        if let Some(listener) = self.live() {
            match listener.add(std::slice::from_ref(&subscription)).await {
                Ok(outcome) => {
                    for (id, reason) in outcome.failed {
                        tracing::warn!(subscription = %id, error = %reason, "live updates unavailable");
                    }
                }
                Err(err) => {
                    tracing::warn!(subscription = %subscription.id, error = %err, "listener registration failed");
                }
            }
        }
        Ok(subscription)
    }

    pub async fn unsubscribe(&self, id: &SubscriptionId) -> Result<Subscription, DaemonError> {
        let subscription = self.repo().load(id).await?;
        self.repo().destroy(id).await?;
        tracing::info!(subscription = %id, "unsubscribed");

        if let Some(listener) = self.live() {
            if let Err(err) = listener.remove(id).await {
                tracing::warn!(subscription = %id, error = %err, "listener deregistration failed");
            }
        }
        Ok(subscription)
    }

    // -----------------------------------------------------------------------
    // Sync
    // -----------------------------------------------------------------------

    /// Run sync attempts and return the sessions that succeeded, in load order.
    ///
    /// A single id that is already syncing yields an empty result. In the
    /// bulk case at most `sync_concurrency` attempts run at once and a
    /// failing subscription never stops the others.
    pub async fn synchronize(&self, request: SyncRequest) -> Result<Vec<SyncSession>, DaemonError> {
        let subscriptions = if request.all {
            self.repo().load_all().await?
        } else {
            let id = request
                .id
                .ok_or_else(|| DaemonError::Payload("sync needs an `id` or `all`".to_string()))?;
            if self.inner.locks.is_locked(&id) {
                tracing::debug!(subscription = %id, "sync already running, skipped");
                return Ok(Vec::new());
            }
            vec![self.repo().load(&id).await?]
        };

        let skip = request.skip;
        let sessions: Vec<Option<SyncSession>> = stream::iter(subscriptions)
            .map(|subscription| self.sync_one(subscription, skip))
            .buffered(self.inner.config.sync_concurrency.max(1))
            .collect()
            .await;
        Ok(sessions.into_iter().flatten().collect())
    }

    async fn sync_one(&self, mut subscription: Subscription, skip: bool) -> Option<SyncSession> {
        let Some(_guard) = self.inner.locks.try_lock(&subscription.id) else {
            tracing::debug!(subscription = %subscription.id, "sync already running, skipped");
            return None;
        };

        match self.inner.engine.sync(&mut subscription, skip).await {
            Ok(session) => Some(session),
            Err(err) if err.is_removed() => {
                tracing::info!(subscription = %subscription.id, error = %err, "library removed remotely");
                None
            }
            Err(err) => {
                tracing::warn!(
                    subscription = %subscription.id,
                    version = subscription.version,
                    error = %err,
                    "sync failed"
                );
                tracing::trace!(subscription = %subscription.id, chain = %error_chain(&err), "sync failure detail");
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    /// Enqueue a job. `delay` and `attempts` fall back to the configured
    /// job defaults; the backoff always comes from configuration.
    ///
    /// Only the job types in [`JOB_TYPES`] are accepted; nothing would ever
    /// consume another.
    pub async fn notify(
        &self,
        kind: &str,
        data: Value,
        delay: Option<Duration>,
        attempts: Option<u32>,
    ) -> Result<Job, DaemonError> {
        if !JOB_TYPES.contains(&kind) {
            return Err(DaemonError::UnknownJobType(kind.to_string()));
        }
        let defaults = &self.inner.config.jobs;
        let mut policy = defaults.retry_policy();
        if let Some(attempts) = attempts {
            policy.attempts = attempts.max(1);
        }
        let job = self
            .inner
            .queue
            .create(
                NewJob::new(kind, data)
                    .delay(delay.unwrap_or_else(|| defaults.delay()))
                    .policy(policy),
            )
            .await?;
        tracing::debug!(job = job.id, kind, delay_ms = job.delay_ms, "job enqueued");
        Ok(job)
    }

    pub async fn notify_sync(
        &self,
        request: SyncRequest,
        delay: Option<Duration>,
    ) -> Result<Job, DaemonError> {
        self.notify(JOB_SYNC, serde_json::to_value(request)?, delay, None)
            .await
    }

    /// Run one job. Unknown types and malformed payloads fail without retry.
    pub async fn process(&self, job: Job) -> Result<(), DaemonError> {
        let id = job.id;
        let kind = job.kind.clone();
        let result = match job.kind.as_str() {
            JOB_SUBSCRIBE => {
                let input: SubscriptionInput = payload(job.data)?;
                self.subscribe(input).await.map(drop)
            }
            JOB_UNSUBSCRIBE => {
                let request: UnsubscribeRequest = payload(job.data)?;
                self.unsubscribe(&request.id).await.map(drop)
            }
            JOB_SYNC => {
                let request: SyncRequest = payload(job.data)?;
                self.synchronize(request).await.map(drop)
            }
            other => Err(DaemonError::UnknownJobType(other.to_string())),
        };
        if let Err(err) = &result {
            tracing::warn!(job = id, kind = %kind, error = %err, "job failed");
        }
        result
    }

    fn handler(&self) -> JobHandler {
        let controller = self.clone();
        Arc::new(move |job| {
            let controller = controller.clone();
            async move { controller.process(job).await }.boxed()
        })
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Initial sync, crash recovery, job consumers, then the listener.
    pub async fn start(&self, job_types: Option<&[&str]>) -> Result<(), DaemonError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(DaemonError::Queue("controller already started".to_string()));
        }

        let survivors: Vec<Subscription> = match self.synchronize(SyncRequest::all()).await {
            Ok(sessions) => sessions.into_iter().map(|s| s.subscription).collect(),
            Err(err) => {
                tracing::warn!(error = %err, "initial sync failed");
                Vec::new()
            }
        };
        tracing::info!(synced = survivors.len(), "initial sync finished");

        for job in self.inner.queue.interrupted().await? {
            tracing::info!(job = job.id, kind = %job.kind, "re-activating interrupted job");
            self.inner.queue.reactivate(job.id).await?;
        }

        let concurrency = self.inner.config.concurrency.max(1);
        for kind in job_types.unwrap_or(&JOB_TYPES) {
            self.inner
                .queue
                .process(kind, concurrency, self.handler())
                .await?;
        }

        if self.inner.config.live {
            self.start_listener(survivors)?;
        }

        if let Some(period) = self.inner.config.resync_interval() {
            let task = tokio::spawn(self.clone().resync_loop(period, self.inner.shutdown.subscribe()));
            self.push_task(task);
        }
        Ok(())
    }

    fn push_task(&self, task: JoinHandle<()>) {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(task);
    }

    fn start_listener(&self, survivors: Vec<Subscription>) -> Result<(), DaemonError> {
        let transport = self
            .inner
            .transport
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let Some(transport) = transport else {
            tracing::warn!("live mode is on but no stream transport was configured");
            return Ok(());
        };
        let (listener, events) =
            Listener::start(transport, ListenerConfig::from(&self.inner.config.reconnect));
        if self.inner.listener.set(listener).is_err() {
            return Err(DaemonError::Transport("listener already running".to_string()));
        }
        let task = tokio::spawn(
            self.clone()
                .pump_events(events, survivors, self.inner.shutdown.subscribe()),
        );
        self.push_task(task);
        Ok(())
    }

    async fn pump_events(
        self,
        mut events: mpsc::UnboundedReceiver<ListenerEvent>,
        survivors: Vec<Subscription>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut survivors = Some(survivors);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    self.on_listener_event(event, &mut survivors).await;
                }
            }
        }
    }

    async fn on_listener_event(
        &self,
        event: ListenerEvent,
        survivors: &mut Option<Vec<Subscription>>,
    ) {
        match event {
            ListenerEvent::Connected => {
                // Later reconnects are re-registered by the listener itself.
                let Some(subscriptions) = survivors.take() else { return };
                let Some(listener) = self.inner.listener.get() else { return };
                match listener.add(&subscriptions).await {
                    Ok(outcome) => tracing::info!(
                        confirmed = outcome.confirmed.len(),
                        failed = outcome.failed.len(),
                        deferred = outcome.deferred.len(),
                        "registered subscriptions for live updates"
                    ),
                    Err(err) => tracing::warn!(error = %err, "live registration failed"),
                }
            }
            ListenerEvent::Updated {
                topic,
                subscriptions,
                version,
            } => {
                for id in subscriptions {
                    tracing::debug!(subscription = %id, topic = %topic, ?version, "remote change");
                    if let Err(err) = self.notify_sync(SyncRequest::one(id.clone()), None).await {
                        tracing::warn!(subscription = %id, error = %err, "could not schedule sync");
                    }
                }
            }
            ListenerEvent::TopicRemoved {
                topic,
                subscriptions,
            } => {
                tracing::info!(topic = %topic, count = subscriptions.len(), "live updates revoked");
            }
            ListenerEvent::Error(message) => {
                tracing::debug!(error = %message, "listener error");
            }
        }
    }

    async fn resync_loop(self, period: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {
                    if let Err(err) = self.notify_sync(SyncRequest::all(), None).await {
                        tracing::warn!(error = %err, "could not schedule periodic sync");
                    }
                }
            }
        }
    }

    pub async fn status(&self) -> Result<ControllerStatus, DaemonError> {
        let subscriptions = self.repo().load_all().await?.len();
        let listener = match self.inner.listener.get() {
            Some(listener) => Some(listener.status().await?),
            None => None,
        };
        Ok(ControllerStatus {
            subscriptions,
            syncing: self.inner.locks.len(),
            jobs: self.inner.queue.counts().await,
            live: self.inner.config.live,
            listener,
        })
    }

    /// Shut down the queue and the listener, each within the configured
    /// timeout, then close the store. Every step runs; the first error is
    /// returned.
    pub async fn stop(&self) -> Result<(), DaemonError> {
        let _ = self.inner.shutdown.send(());
        let timeout = self.inner.config.shutdown_timeout();
        let mut first_error = None;

        if let Err(err) = self.inner.queue.shutdown(timeout).await {
            tracing::error!(error = %err, "job queue shutdown");
            first_error.get_or_insert(err);
        }
        if let Some(listener) = self.inner.listener.get() {
            if let Err(err) = listener.stop(timeout).await {
                tracing::error!(error = %err, "listener shutdown");
                first_error.get_or_insert(err);
            }
        }

        let tasks: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if tokio::time::timeout(timeout, task).await.is_err() {
                tracing::warn!("background task did not stop in time");
            }
        }

        if let Err(err) = self.repo().store().close().await {
            tracing::error!(error = %err, "closing store");
            first_error.get_or_insert(err.into());
        }

        tracing::info!("controller stopped");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn payload<T: serde::de::DeserializeOwned>(data: Value) -> Result<T, DaemonError> {
    serde_json::from_value(data).map_err(|e| DaemonError::Payload(e.to_string()))
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}
