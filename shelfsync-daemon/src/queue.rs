//! Job queue collaborator.
//!
//! The controller only creates and consumes jobs through [`JobQueue`]; retry
//! and delay bookkeeping live here, driven by the [`RetryPolicy`] attached to
//! every job.
//!
//! [`MemoryQueue`] keeps jobs in memory and journals the unfinished ones to a
//! JSON file so a restart can find jobs that were active when the previous
//! process died:
//!
//! ```text
//! create ─► delayed ──(timer)──► queued ─► active ─┬─► complete (dropped)
//!              ▲                                   │
//!              └──────(retryable, attempts left)───┤
//!                                                  └─► failed (dropped)
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use shelfsync_core::RetryPolicy;

use crate::error::{io_err, DaemonError};

pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Delayed,
    Queued,
    Active,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub delay_ms: u64,
    pub policy: RetryPolicy,
    /// Attempts finished so far.
    pub attempts_made: u32,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Left unfinished by a previous process; see [`JobQueue::interrupted`].
    #[serde(default)]
    pub interrupted: bool,
    pub created_at: DateTime<Utc>,
}

/// Parameters for [`JobQueue::create`].
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: String,
    pub data: Value,
    pub delay: Duration,
    pub policy: RetryPolicy,
}

impl NewJob {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            delay: Duration::ZERO,
            policy: RetryPolicy::default(),
        }
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Handles one job; an `Err` goes through the job's retry policy when
/// [`DaemonError::is_retryable`] allows it.
pub type JobHandler =
    Arc<dyn Fn(Job) -> BoxFuture<'static, Result<(), DaemonError>> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub delayed: usize,
    pub queued: usize,
    pub active: usize,
    pub interrupted: usize,
    pub completed: u64,
    pub failed: u64,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn create(&self, job: NewJob) -> Result<Job, DaemonError>;

    /// Start `concurrency` workers for jobs of `kind`. Each worker runs one
    /// job to completion before taking the next.
    async fn process(
        &self,
        kind: &str,
        concurrency: usize,
        handler: JobHandler,
    ) -> Result<(), DaemonError>;

    /// Jobs a previous process left active.
    async fn interrupted(&self) -> Result<Vec<Job>, DaemonError>;

    /// Put an interrupted job back in line.
    async fn reactivate(&self, id: JobId) -> Result<(), DaemonError>;

    async fn counts(&self) -> QueueCounts;

    /// Stop handing out jobs and wait up to `timeout` for active ones.
    /// Jobs still running afterwards are marked failed and interrupted.
    async fn shutdown(&self, timeout: Duration) -> Result<(), DaemonError>;
}

// ---------------------------------------------------------------------------
// MemoryQueue
// ---------------------------------------------------------------------------

#[derive(Default)]
struct State {
    next_id: JobId,
    jobs: BTreeMap<JobId, Job>,
    channels: HashMap<String, mpsc::UnboundedSender<JobId>>,
    /// Ready jobs of kinds nobody is processing yet.
    backlog: HashMap<String, VecDeque<JobId>>,
    completed: u64,
    failed: u64,
}

impl State {
    fn enqueue(&mut self, id: JobId) {
        let Some(job) = self.jobs.get_mut(&id) else {
            return;
        };
        job.state = JobState::Queued;
        let kind = job.kind.clone();
        if let Some(tx) = self.channels.get(&kind) {
            if tx.send(id).is_ok() {
                return;
            }
        }
        self.backlog.entry(kind).or_default().push_back(id);
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Journal {
    next_id: JobId,
    jobs: Vec<Job>,
}

struct Inner {
    state: Mutex<State>,
    journal: Option<PathBuf>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// In-process [`JobQueue`] with an optional JSON journal.
#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<Inner>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::with_state(State::default(), None)
    }
}

impl MemoryQueue {
    /// A queue without a journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// A queue journaled at `path`, recovering whatever a previous process
    /// left there. Jobs that were active become interrupted; delayed and
    /// queued jobs are ready immediately.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, DaemonError> {
        let path = path.into();
        let journal = read_journal(&path)?;

        let mut state = State {
            next_id: journal.next_id,
            ..State::default()
        };
        let mut ready = Vec::new();
        for mut job in journal.jobs {
            state.next_id = state.next_id.max(job.id);
            match job.state {
                JobState::Active | JobState::Failed => {
                    job.state = JobState::Failed;
                    job.interrupted = true;
                    job.error.get_or_insert_with(|| "interrupted".to_string());
                }
                JobState::Delayed | JobState::Queued => ready.push(job.id),
            }
            state.jobs.insert(job.id, job);
        }
        for id in ready {
            state.enqueue(id);
        }
        tracing::debug!(path = %path.display(), jobs = state.jobs.len(), "job journal loaded");
        Ok(Self::with_state(state, Some(path)))
    }

    fn with_state(state: State, journal: Option<PathBuf>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                journal,
                shutdown,
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Snapshot of every unfinished job, ordered by id.
    pub fn jobs(&self) -> Vec<Job> {
        self.inner.lock().jobs.values().cloned().collect()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Write the journal. Runs under the state lock so snapshots never
    /// land out of order.
    fn persist(&self, state: &State) {
        let Some(path) = &self.journal else {
            return;
        };
        let journal = Journal {
            next_id: state.next_id,
            jobs: state.jobs.values().cloned().collect(),
        };
        if let Err(err) = write_journal(path, &journal) {
            tracing::error!(error = %err, "failed to write job journal");
        }
    }

    fn schedule(self: &Arc<Self>, id: JobId, delay: Duration) {
        let inner = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
            let mut state = inner.lock();
            if state.jobs.get(&id).map(|j| j.state) == Some(JobState::Delayed) {
                state.enqueue(id);
                inner.persist(&state);
            }
        });
    }

    fn activate(&self, id: JobId) -> Option<Job> {
        let mut state = self.lock();
        let job = state.jobs.get_mut(&id)?;
        if job.state != JobState::Queued {
            return None;
        }
        job.state = JobState::Active;
        let job = job.clone();
        self.persist(&state);
        Some(job)
    }

    fn finish(self: &Arc<Self>, id: JobId, result: Result<(), DaemonError>) {
        let mut state = self.lock();
        let Some(job) = state.jobs.get_mut(&id) else {
            return;
        };
        job.attempts_made += 1;
        let attempts_made = job.attempts_made;
        let policy = job.policy;
        let kind = job.kind.clone();

        let retry_in = match result {
            Ok(()) => {
                state.jobs.remove(&id);
                state.completed += 1;
                tracing::debug!(job = id, kind = %kind, "job completed");
                None
            }
            Err(err) if err.is_retryable() && attempts_made < policy.attempts => {
                let delay = policy.backoff.delay_for(attempts_made);
                if let Some(job) = state.jobs.get_mut(&id) {
                    job.state = JobState::Delayed;
                    job.interrupted = false;
                    job.error = Some(err.to_string());
                }
                tracing::warn!(
                    job = id,
                    kind = %kind,
                    attempt = attempts_made,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "job failed; will retry"
                );
                Some(delay)
            }
            Err(err) => {
                state.jobs.remove(&id);
                state.failed += 1;
                tracing::error!(
                    job = id,
                    kind = %kind,
                    attempts = attempts_made,
                    error = %err,
                    "job failed"
                );
                None
            }
        };
        self.persist(&state);
        drop(state);

        if let Some(delay) = retry_in {
            if !self.stopping() {
                self.schedule(id, delay);
            }
        }
    }

    async fn worker(
        self: Arc<Self>,
        rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<JobId>>>,
        handler: JobHandler,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let next = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => None,
                    id = rx.recv() => id,
                }
            };
            let Some(id) = next else {
                break;
            };
            let Some(job) = self.activate(id) else {
                continue;
            };
            tracing::debug!(job = id, kind = %job.kind, attempt = job.attempts_made + 1, "job started");
            let result = handler(job).await;
            self.finish(id, result);
        }
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn create(&self, new: NewJob) -> Result<Job, DaemonError> {
        if self.inner.stopping() {
            return Err(DaemonError::Queue("queue is shutting down".to_string()));
        }

        let mut state = self.inner.lock();
        state.next_id += 1;
        let job = Job {
            id: state.next_id,
            kind: new.kind,
            data: new.data,
            delay_ms: new.delay.as_millis() as u64,
            policy: RetryPolicy {
                attempts: new.policy.attempts.max(1),
                backoff: new.policy.backoff,
            },
            attempts_made: 0,
            state: JobState::Delayed,
            error: None,
            interrupted: false,
            created_at: Utc::now(),
        };
        let id = job.id;
        state.jobs.insert(id, job);
        if new.delay.is_zero() {
            state.enqueue(id);
        }
        let created = state.jobs.get(&id).cloned();
        self.inner.persist(&state);
        drop(state);

        if !new.delay.is_zero() {
            self.inner.schedule(id, new.delay);
        }
        created.ok_or_else(|| DaemonError::Queue(format!("job {id} vanished after creation")))
    }

    async fn process(
        &self,
        kind: &str,
        concurrency: usize,
        handler: JobHandler,
    ) -> Result<(), DaemonError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.inner.lock();
            if state.channels.contains_key(kind) {
                return Err(DaemonError::Queue(format!(
                    "jobs of type '{kind}' are already being processed"
                )));
            }
            for id in state.backlog.remove(kind).unwrap_or_default() {
                // Receiver is alive; send cannot fail here.
                let _ = tx.send(id);
            }
            state.channels.insert(kind.to_string(), tx);
        }

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut workers = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for _ in 0..concurrency.max(1) {
            let inner = Arc::clone(&self.inner);
            workers.push(tokio::spawn(inner.worker(Arc::clone(&rx), Arc::clone(&handler))));
        }
        tracing::info!(kind, concurrency = concurrency.max(1), "processing jobs");
        Ok(())
    }

    async fn interrupted(&self) -> Result<Vec<Job>, DaemonError> {
        Ok(self
            .inner
            .lock()
            .jobs
            .values()
            .filter(|job| job.interrupted && job.state == JobState::Failed)
            .cloned()
            .collect())
    }

    async fn reactivate(&self, id: JobId) -> Result<(), DaemonError> {
        let mut state = self.inner.lock();
        let job = state
            .jobs
            .get_mut(&id)
            .filter(|job| job.interrupted)
            .ok_or_else(|| DaemonError::Queue(format!("job {id} is not interrupted")))?;
        job.interrupted = false;
        job.error = None;
        state.enqueue(id);
        self.inner.persist(&state);
        Ok(())
    }

    async fn counts(&self) -> QueueCounts {
        let state = self.inner.lock();
        let mut counts = QueueCounts {
            completed: state.completed,
            failed: state.failed,
            ..QueueCounts::default()
        };
        for job in state.jobs.values() {
            match job.state {
                JobState::Delayed => counts.delayed += 1,
                JobState::Queued => counts.queued += 1,
                JobState::Active => counts.active += 1,
                JobState::Failed => counts.interrupted += 1,
            }
        }
        counts
    }

    async fn shutdown(&self, timeout: Duration) -> Result<(), DaemonError> {
        self.inner.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .inner
                .workers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );

        let finished = tokio::time::timeout(timeout, futures::future::join_all(handles)).await;

        let mut state = self.inner.lock();
        state.channels.clear();
        let result = match finished {
            Ok(_) => Ok(()),
            Err(_) => {
                let mut pending = 0;
                for job in state.jobs.values_mut() {
                    if job.state == JobState::Active {
                        job.state = JobState::Failed;
                        job.interrupted = true;
                        job.error = Some("shutdown timeout".to_string());
                        pending += 1;
                    }
                }
                Err(DaemonError::ShutdownTimeout {
                    component: "job queue",
                    pending,
                })
            }
        };
        self.inner.persist(&state);
        result
    }
}

// ---------------------------------------------------------------------------
// Journal I/O
// ---------------------------------------------------------------------------

fn read_journal(path: &Path) -> Result<Journal, DaemonError> {
    if !path.exists() {
        return Ok(Journal::default());
    }
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    if contents.trim().is_empty() {
        return Ok(Journal::default());
    }
    Ok(serde_json::from_str(&contents)?)
}

fn write_journal(path: &Path, journal: &Journal) -> Result<(), DaemonError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    }
    let json = serde_json::to_string_pretty(journal)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
    Ok(())
}
