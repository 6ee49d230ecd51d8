//! Push-stream listener.
//!
//! One background task owns the [`Transport`] and a registry of
//! `(subscription, api key, topic)` entries. Callers talk to it through a
//! [`Listener`] handle; what the stream reports comes back as
//! [`ListenerEvent`]s on the receiver returned by [`Listener::start`].
//!
//! The listener never syncs anything itself. `topicUpdated` turns into
//! [`ListenerEvent::Updated`] and the owner decides what to schedule.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use shelfsync_core::config::ReconnectConfig;
use shelfsync_core::{Subscription, SubscriptionId};

use crate::error::DaemonError;
use crate::transport::{ClientMessage, ServerMessage, TopicBatch, TopicError, TopicRef, Transport};

#[derive(Debug, Clone, Copy)]
pub struct ListenerConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// How long `add` waits for the server to confirm a batch.
    pub confirm_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            confirm_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&ReconnectConfig> for ListenerConfig {
    fn from(reconnect: &ReconnectConfig) -> Self {
        Self {
            initial_backoff: Duration::from_millis(reconnect.initial_backoff_ms.max(1)),
            max_backoff: Duration::from_millis(
                reconnect.max_backoff_ms.max(reconnect.initial_backoff_ms),
            ),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// The stream confirmed the connection is ready.
    Connected,
    Updated {
        topic: String,
        subscriptions: Vec<SubscriptionId>,
        version: Option<u64>,
    },
    TopicRemoved {
        topic: String,
        subscriptions: Vec<SubscriptionId>,
    },
    /// Transport trouble. The listener keeps reconnecting.
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub id: SubscriptionId,
    pub key: Option<String>,
    pub topic: String,
    pub confirmed: bool,
}

impl Registration {
    fn of(subscription: &Subscription) -> Self {
        Self {
            id: subscription.id.clone(),
            key: subscription.key.clone(),
            topic: subscription.topic(),
            confirmed: false,
        }
    }

    fn same_topic(&self, other: &Registration) -> bool {
        self.key == other.key && self.topic == other.topic
    }
}

/// Result of one [`Listener::add`] call.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct AddOutcome {
    pub confirmed: Vec<SubscriptionId>,
    pub failed: Vec<(SubscriptionId, String)>,
    /// Kept in the registry and sent once the stream is (re)connected.
    pub deferred: Vec<SubscriptionId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenerStatus {
    pub connected: bool,
    pub registrations: Vec<Registration>,
}

enum Command {
    Add {
        entries: Vec<Registration>,
        reply: oneshot::Sender<AddOutcome>,
    },
    Remove {
        id: SubscriptionId,
        reply: oneshot::Sender<bool>,
    },
    Status {
        reply: oneshot::Sender<ListenerStatus>,
    },
    Stop,
}

/// Handle to the listener task.
pub struct Listener {
    commands: mpsc::UnboundedSender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
    confirm_timeout: Duration,
}

impl Listener {
    /// Spawn the listener task. It connects right away and keeps
    /// reconnecting until [`Listener::stop`].
    pub fn start(
        transport: Box<dyn Transport>,
        config: ListenerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ListenerEvent>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let task = ListenerTask {
            transport,
            config,
            link: Link::Down {
                retry_at: Instant::now(),
            },
            backoff: config.initial_backoff,
            registry: Vec::new(),
            pending: VecDeque::new(),
            events,
        };
        let handle = tokio::spawn(task.run(command_rx));
        let listener = Self {
            commands,
            task: Mutex::new(Some(handle)),
            confirm_timeout: config.confirm_timeout,
        };
        (listener, event_rx)
    }

    /// Register the subscriptions' topics in one batch. Ids already in the
    /// registry are left alone.
    pub async fn add(&self, subscriptions: &[Subscription]) -> Result<AddOutcome, DaemonError> {
        if subscriptions.is_empty() {
            return Ok(AddOutcome::default());
        }
        let entries: Vec<Registration> = subscriptions.iter().map(Registration::of).collect();
        let ids: Vec<SubscriptionId> = entries.iter().map(|e| e.id.clone()).collect();
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Add { entries, reply })
            .map_err(|_| DaemonError::ChannelClosed("listener"))?;
        match tokio::time::timeout(self.confirm_timeout, rx).await {
            Ok(outcome) => outcome.map_err(|_| DaemonError::ChannelClosed("listener")),
            Err(_) => {
                tracing::warn!(count = ids.len(), "stream did not confirm registration in time");
                Ok(AddOutcome {
                    deferred: ids,
                    ..AddOutcome::default()
                })
            }
        }
    }

    /// Drop the subscription from the registry. Returns whether it was there.
    pub async fn remove(&self, id: &SubscriptionId) -> Result<bool, DaemonError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Remove {
                id: id.clone(),
                reply,
            })
            .map_err(|_| DaemonError::ChannelClosed("listener"))?;
        rx.await.map_err(|_| DaemonError::ChannelClosed("listener"))
    }

    pub async fn status(&self) -> Result<ListenerStatus, DaemonError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Status { reply })
            .map_err(|_| DaemonError::ChannelClosed("listener"))?;
        rx.await.map_err(|_| DaemonError::ChannelClosed("listener"))
    }

    /// Close the stream and wait up to `timeout` for the task to exit.
    pub async fn stop(&self, timeout: Duration) -> Result<(), DaemonError> {
        let handle = self
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let Some(mut handle) = handle else {
            return Ok(());
        };
        let _ = self.commands.send(Command::Stop);
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(DaemonError::Transport(format!(
                "listener task join failure: {err}"
            ))),
            Err(_) => {
                handle.abort();
                Err(DaemonError::ShutdownTimeout {
                    component: "listener",
                    pending: 1,
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

enum Link {
    Down { retry_at: Instant },
    /// Socket open, waiting for the `connected` event.
    Open,
    Ready,
}

struct PendingBatch {
    entries: Vec<Registration>,
    reply: Option<oneshot::Sender<AddOutcome>>,
    /// Ids skipped as already registered; reported as confirmed.
    already: Vec<SubscriptionId>,
}

struct ListenerTask {
    transport: Box<dyn Transport>,
    config: ListenerConfig,
    link: Link,
    backoff: Duration,
    registry: Vec<Registration>,
    pending: VecDeque<PendingBatch>,
    events: mpsc::UnboundedSender<ListenerEvent>,
}

impl ListenerTask {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let retry_at = match self.link {
                Link::Down { retry_at } => Some(retry_at),
                _ => None,
            };
            let open = !matches!(self.link, Link::Down { .. });

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Stop) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                message = self.transport.recv(), if open => match message {
                    Ok(Some(message)) => self.handle_message(message).await,
                    Ok(None) => self.disconnected("stream connection closed".to_string()).await,
                    Err(err) => self.disconnected(err.to_string()).await,
                },
                _ = sleep_until(retry_at), if retry_at.is_some() => self.connect().await,
            }
        }

        self.pending.clear();
        if let Err(err) = self.transport.close().await {
            tracing::debug!(error = %err, "closing stream transport");
        }
        tracing::info!("listener stopped");
    }

    fn emit(&self, event: ListenerEvent) {
        let _ = self.events.send(event);
    }

    async fn connect(&mut self) {
        match self.transport.connect().await {
            Ok(()) => {
                tracing::debug!("stream transport connected, awaiting ready event");
                self.link = Link::Open;
            }
            Err(err) => {
                tracing::warn!(error = %err, retry_in_ms = self.backoff.as_millis() as u64, "stream connect failed");
                self.emit(ListenerEvent::Error(err.to_string()));
                self.schedule_retry();
            }
        }
    }

    async fn disconnected(&mut self, reason: String) {
        tracing::warn!(error = %reason, retry_in_ms = self.backoff.as_millis() as u64, "stream connection lost");
        let _ = self.transport.close().await;
        for entry in &mut self.registry {
            entry.confirmed = false;
        }
        for batch in self.pending.drain(..) {
            if let Some(reply) = batch.reply {
                let mut deferred = batch.already;
                deferred.extend(batch.entries.into_iter().map(|e| e.id));
                let _ = reply.send(AddOutcome {
                    deferred,
                    ..AddOutcome::default()
                });
            }
        }
        self.emit(ListenerEvent::Error(reason));
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        self.link = Link::Down {
            retry_at: Instant::now() + self.backoff,
        };
        self.backoff = (self.backoff * 2).min(self.config.max_backoff);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Add { entries, reply } => self.add(entries, reply).await,
            Command::Remove { id, reply } => {
                let removed = self.remove(&id).await;
                let _ = reply.send(removed);
            }
            Command::Status { reply } => {
                let _ = reply.send(ListenerStatus {
                    connected: matches!(self.link, Link::Ready),
                    registrations: self.registry.clone(),
                });
            }
            Command::Stop => {}
        }
    }

    async fn add(&mut self, entries: Vec<Registration>, reply: oneshot::Sender<AddOutcome>) {
        let mut fresh = Vec::new();
        let mut already = Vec::new();
        for entry in entries {
            if self.registry.iter().any(|r| r.id == entry.id)
                || fresh.iter().any(|r: &Registration| r.id == entry.id)
            {
                already.push(entry.id);
            } else {
                fresh.push(entry);
            }
        }
        self.registry.extend(fresh.iter().cloned());

        if !matches!(self.link, Link::Ready) {
            let mut deferred = already;
            deferred.extend(fresh.into_iter().map(|e| e.id));
            let _ = reply.send(AddOutcome {
                deferred,
                ..AddOutcome::default()
            });
            return;
        }
        if fresh.is_empty() {
            let _ = reply.send(AddOutcome {
                confirmed: already,
                ..AddOutcome::default()
            });
            return;
        }
        self.send_batch(fresh, Some(reply), already).await;
    }

    /// Send one `createSubscriptions` for `entries`, grouped by api key.
    async fn send_batch(
        &mut self,
        entries: Vec<Registration>,
        reply: Option<oneshot::Sender<AddOutcome>>,
        already: Vec<SubscriptionId>,
    ) {
        let mut by_key: BTreeMap<Option<String>, BTreeSet<String>> = BTreeMap::new();
        for entry in &entries {
            by_key
                .entry(entry.key.clone())
                .or_default()
                .insert(entry.topic.clone());
        }
        let message = ClientMessage::CreateSubscriptions {
            subscriptions: by_key
                .into_iter()
                .map(|(api_key, topics)| TopicBatch {
                    api_key,
                    topics: topics.into_iter().collect(),
                })
                .collect(),
        };
        tracing::debug!(count = entries.len(), "registering topics");
        self.pending.push_back(PendingBatch {
            entries,
            reply,
            already,
        });
        if let Err(err) = self.transport.send(&message).await {
            self.disconnected(err.to_string()).await;
        }
    }

    async fn remove(&mut self, id: &SubscriptionId) -> bool {
        let Some(index) = self.registry.iter().position(|r| &r.id == id) else {
            return false;
        };
        let entry = self.registry.remove(index);
        let shared = self.registry.iter().any(|r| r.same_topic(&entry));
        if shared {
            tracing::debug!(subscription = %id, topic = %entry.topic, "topic still in use, keeping it registered");
            return true;
        }
        if matches!(self.link, Link::Ready) {
            let message = ClientMessage::DeleteSubscriptions {
                subscriptions: vec![TopicRef {
                    api_key: entry.key.clone(),
                    topic: entry.topic.clone(),
                }],
            };
            if let Err(err) = self.transport.send(&message).await {
                self.disconnected(err.to_string()).await;
            }
        }
        true
    }

    async fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Connected { retry } => {
                if let Some(ms) = retry {
                    self.config.initial_backoff = Duration::from_millis(ms.max(1));
                }
                self.link = Link::Ready;
                self.backoff = self.config.initial_backoff;
                tracing::info!(registered = self.registry.len(), "stream connected");
                self.emit(ListenerEvent::Connected);
                if !self.registry.is_empty() {
                    let entries = self.registry.clone();
                    self.send_batch(entries, None, Vec::new()).await;
                }
            }
            ServerMessage::SubscriptionsCreated {
                subscriptions,
                errors,
            } => self.confirm(subscriptions, errors),
            ServerMessage::TopicUpdated { topic, version } => {
                let subscriptions: Vec<SubscriptionId> = self
                    .registry
                    .iter()
                    .filter(|r| r.topic == topic)
                    .map(|r| r.id.clone())
                    .collect();
                if subscriptions.is_empty() {
                    tracing::debug!(topic = %topic, "update for a topic nobody registered");
                    return;
                }
                tracing::debug!(topic = %topic, ?version, count = subscriptions.len(), "topic updated");
                self.emit(ListenerEvent::Updated {
                    topic,
                    subscriptions,
                    version,
                });
            }
            ServerMessage::TopicRemoved { api_key, topic } => {
                let mut subscriptions = Vec::new();
                self.registry.retain(|r| {
                    let hit = r.topic == topic && (api_key.is_none() || r.key == api_key);
                    if hit {
                        subscriptions.push(r.id.clone());
                    }
                    !hit
                });
                tracing::info!(topic = %topic, count = subscriptions.len(), "stream removed topic");
                self.emit(ListenerEvent::TopicRemoved {
                    topic,
                    subscriptions,
                });
            }
        }
    }

    /// Match a `subscriptionsCreated` reply against the oldest pending batch.
    fn confirm(&mut self, created: Vec<TopicBatch>, errors: Vec<TopicError>) {
        let Some(batch) = self.pending.pop_front() else {
            tracing::debug!("subscriptionsCreated without a pending batch");
            return;
        };
        let mut outcome = AddOutcome {
            confirmed: batch.already,
            ..AddOutcome::default()
        };

        for entry in batch.entries {
            let rejected = errors.iter().find(|e| {
                e.api_key == entry.key && e.topic.as_ref().map_or(true, |t| t == &entry.topic)
            });
            let accepted = created
                .iter()
                .any(|b| b.api_key == entry.key && b.topics.contains(&entry.topic));

            if let Some(error) = rejected {
                tracing::warn!(subscription = %entry.id, topic = %entry.topic, error = %error.error, "stream rejected topic");
                self.registry.retain(|r| r.id != entry.id);
                outcome.failed.push((entry.id, error.error.clone()));
            } else if accepted {
                if let Some(r) = self.registry.iter_mut().find(|r| r.id == entry.id) {
                    r.confirmed = true;
                }
                outcome.confirmed.push(entry.id);
            } else {
                self.registry.retain(|r| r.id != entry.id);
                outcome
                    .failed
                    .push((entry.id, "topic missing from confirmation".to_string()));
            }
        }

        if let Some(reply) = batch.reply {
            let _ = reply.send(outcome);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
