//! Controller operations against in-memory store, source, queue and stream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use serde_json::json;

use shelfsync_core::{
    Config, CoreError, MemoryStore, PluginBinding, Subscription, SubscriptionId,
    SubscriptionInput, SubscriptionRepo,
};
use shelfsync_daemon::transport::{ClientMessage, ServerMessage, TopicBatch};
use shelfsync_daemon::{
    Controller, DaemonError, JobQueue, JobState, MemoryQueue, MemoryTransport, NewJob, SyncRequest,
};
use shelfsync_plugins::{PluginDescriptor, PluginError, PluginRegistry};
use shelfsync_sync::{MemorySource, RemoteEntry, SyncEngine};

type Calls = Arc<Mutex<Vec<String>>>;

/// Plugin calls in flight right now, and the most seen at once.
#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

struct Harness {
    source: MemorySource,
    repo: SubscriptionRepo,
    queue: MemoryQueue,
    controller: Controller,
    calls: Calls,
    gauge: Arc<Gauge>,
}

/// `record` logs `<subscription> v<version>`; `slow` does the same after
/// 100ms; `gauge` is `slow` that also feeds the [`Gauge`]; `broken` always
/// fails.
fn registry(calls: &Calls, gauge: &Arc<Gauge>) -> PluginRegistry {
    let mut registry = PluginRegistry::with_builtins().expect("builtins");
    let seen = Arc::clone(calls);
    registry
        .add(PluginDescriptor::named("record").process(move |session, _| {
            let seen = Arc::clone(&seen);
            let line = format!("{} v{}", session.subscription.id, session.version);
            async move {
                seen.lock().unwrap().push(line);
                Ok(())
            }
            .boxed()
        }))
        .expect("record");
    let seen = Arc::clone(calls);
    registry
        .add(PluginDescriptor::named("slow").process(move |session, _| {
            let seen = Arc::clone(&seen);
            let line = format!("{} v{}", session.subscription.id, session.version);
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                seen.lock().unwrap().push(line);
                Ok(())
            }
            .boxed()
        }))
        .expect("slow");
    let gauge = Arc::clone(gauge);
    registry
        .add(PluginDescriptor::named("gauge").process(move |_, _| {
            let gauge = Arc::clone(&gauge);
            async move {
                let now = gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
                gauge.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                gauge.current.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        }))
        .expect("gauge");
    registry
        .add(PluginDescriptor::named("broken").process(|_, _| {
            async { Err(PluginError::failed("broken", "backend unavailable")) }.boxed()
        }))
        .expect("broken");
    registry
}

fn harness_with(config: Config, queue: MemoryQueue) -> Harness {
    let calls: Calls = Arc::new(Mutex::new(Vec::new()));
    let gauge = Arc::new(Gauge::default());
    let source = MemorySource::new();
    let repo = SubscriptionRepo::new(Arc::new(MemoryStore::new()));
    let engine = SyncEngine::new(
        Arc::new(source.clone()),
        Arc::new(registry(&calls, &gauge)),
        repo.clone(),
    );
    let controller = Controller::new(engine, Arc::new(queue.clone()), config);
    Harness {
        source,
        repo,
        queue,
        controller,
        calls,
        gauge,
    }
}

fn harness() -> Harness {
    harness_with(Config::default(), MemoryQueue::new())
}

fn input(id: &str, plugins: &[&str]) -> SubscriptionInput {
    SubscriptionInput {
        id: Some(id.into()),
        url: format!("https://api.example.org/users/{id}/items"),
        key: Some("secret".to_string()),
        plugins: plugins.iter().map(|p| PluginBinding::new(*p)).collect(),
    }
}

/// Saved subscription at version 5 whose remote is at version 6.
async fn stale(h: &Harness, id: &str, plugins: &[&str]) -> Subscription {
    let mut sub = Subscription::from_input(input(id, plugins)).expect("input");
    h.repo.save(&sub).await.expect("save");
    h.repo.commit(&mut sub, 5, &[], &[]).await.expect("commit");
    h.source.set_version(&sub.id, 5);
    h.source.push(&sub.id, RemoteEntry::live("item", json!({"n": 1})));
    sub
}

async fn version(h: &Harness, id: &str) -> u64 {
    h.repo.load(&id.into()).await.expect("load").version
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

// ---------------------------------------------------------------------------
// subscribe / unsubscribe
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subscribe_persists_and_schedules_immediate_sync() {
    let h = harness();
    let sub = h
        .controller
        .subscribe(input("lib", &["record"]))
        .await
        .expect("subscribe");

    assert_eq!(sub.version, 0);
    assert!(h.repo.exists(&sub.id).await.unwrap());
    let jobs = h.queue.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].kind, "sync");
    assert_eq!(jobs[0].delay_ms, 0);
    assert_eq!(jobs[0].data, json!({"id": "lib", "all": false, "skip": false}));
}

#[tokio::test]
async fn invalid_plugin_configuration_blocks_the_save() {
    let h = harness();
    // `file` requires `directory`.
    let err = h
        .controller
        .subscribe(input("lib", &["file"]))
        .await
        .unwrap_err();

    assert!(matches!(err, DaemonError::Plugin(ref e) if e.is_configuration()));
    assert!(!err.is_retryable());
    assert!(h.repo.load_all().await.unwrap().is_empty());
    assert!(h.queue.jobs().is_empty());
}

#[tokio::test]
async fn malformed_input_is_a_validation_error() {
    let h = harness();
    let mut bad = input("lib", &[]);
    bad.url = "not a url".to_string();
    let err = h.controller.subscribe(bad).await.unwrap_err();
    assert!(matches!(err, DaemonError::Core(CoreError::Validation(_))));
}

#[tokio::test]
async fn resubscribing_keeps_the_committed_version() {
    let h = harness();
    stale(&h, "lib", &["record"]).await;
    let sub = h
        .controller
        .subscribe(input("lib", &["record", "logger"]))
        .await
        .expect("resubscribe");
    assert_eq!(sub.version, 5);
    assert_eq!(h.repo.load(&sub.id).await.unwrap().plugins.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn resubscribing_during_a_sync_keeps_the_new_version() {
    let h = harness();
    stale(&h, "lib", &["slow"]).await;

    let controller = h.controller.clone();
    let sync = tokio::spawn(async move { controller.synchronize(SyncRequest::one("lib")).await });
    let controller = h.controller.clone();
    eventually("sync to take the lock", || {
        controller.locks().is_locked(&SubscriptionId::from("lib"))
    })
    .await;

    let during = h
        .controller
        .subscribe(input("lib", &["slow", "logger"]))
        .await
        .expect("resubscribe");
    assert_eq!(during.version, 5);

    let sessions = sync.await.expect("join").expect("sync");
    assert_eq!(sessions.len(), 1);

    // A stale record written after the commit must not rewind it either.
    h.controller
        .subscribe(input("lib", &["slow"]))
        .await
        .expect("resubscribe after commit");
    let stored = h.repo.load(&"lib".into()).await.unwrap();
    assert_eq!(stored.version, 6);
    assert_eq!(stored.plugins.len(), 1);
    assert!(!stored.never_synced());
}

#[tokio::test]
async fn explicit_ids_must_not_collide_with_store_keys() {
    let h = harness();
    let err = h
        .controller
        .subscribe(input("a:items", &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::Core(CoreError::Validation(_))));
    assert!(h.repo.load_all().await.unwrap().is_empty());
    assert!(h.queue.jobs().is_empty());
}

#[tokio::test]
async fn unsubscribe_missing_id_is_not_found() {
    let h = harness();
    let err = h.controller.unsubscribe(&"ghost".into()).await.unwrap_err();
    assert!(matches!(err, DaemonError::Core(CoreError::NotFound { .. })));

    stale(&h, "lib", &[]).await;
    h.controller.unsubscribe(&"lib".into()).await.expect("unsubscribe");
    assert!(!h.repo.exists(&"lib".into()).await.unwrap());
}

// ---------------------------------------------------------------------------
// synchronize
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn concurrent_sync_of_one_id_runs_once() {
    let h = harness();
    stale(&h, "lib", &["slow"]).await;

    let (a, b) = tokio::join!(
        h.controller.synchronize(SyncRequest::one("lib")),
        h.controller.synchronize(SyncRequest::one("lib")),
    );
    let mut sizes = vec![a.expect("first").len(), b.expect("second").len()];
    sizes.sort_unstable();

    assert_eq!(sizes, vec![0, 1]);
    assert_eq!(*h.calls.lock().unwrap(), vec!["lib v6".to_string()]);
    assert!(h.controller.locks().is_empty());
}

#[tokio::test]
async fn bulk_sync_isolates_failures() {
    let h = harness();
    stale(&h, "a", &["record"]).await;
    stale(&h, "b", &["broken"]).await;
    stale(&h, "c", &["record"]).await;
    stale(&h, "gone", &["record"]).await;
    h.source.remove(&"gone".into());

    let sessions = h
        .controller
        .synchronize(SyncRequest::all())
        .await
        .expect("bulk sync");

    let ids: Vec<&str> = sessions
        .iter()
        .map(|s| s.subscription.id.0.as_str())
        .collect();
    assert_eq!(ids, vec!["a", "c"]);
    assert_eq!(version(&h, "a").await, 6);
    assert_eq!(version(&h, "b").await, 5);
    assert_eq!(version(&h, "c").await, 6);
    assert_eq!(version(&h, "gone").await, 5);
    assert!(h.controller.locks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn bulk_sync_stays_within_sync_concurrency() {
    let config = Config {
        sync_concurrency: 2,
        concurrency: 8,
        ..Config::default()
    };
    let h = harness_with(config, MemoryQueue::new());
    for id in ["a", "b", "c", "d", "e"] {
        stale(&h, id, &["gauge"]).await;
    }

    let sessions = h
        .controller
        .synchronize(SyncRequest::all())
        .await
        .expect("bulk sync");

    assert_eq!(sessions.len(), 5);
    assert_eq!(h.gauge.peak.load(Ordering::SeqCst), 2);
    assert_eq!(h.gauge.current.load(Ordering::SeqCst), 0);
    for id in ["a", "b", "c", "d", "e"] {
        assert_eq!(version(&h, id).await, 6);
    }
}

#[tokio::test]
async fn skip_fast_forwards_without_plugins() {
    let h = harness();
    stale(&h, "lib", &["record"]).await;

    let sessions = h
        .controller
        .synchronize(SyncRequest::one("lib").skip(true))
        .await
        .expect("skip");

    assert_eq!(sessions.len(), 1);
    assert_eq!(version(&h, "lib").await, 6);
    assert!(h.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn sync_of_unknown_id_is_not_found() {
    let h = harness();
    let err = h
        .controller
        .synchronize(SyncRequest::one("ghost"))
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::Core(CoreError::NotFound { .. })));
}

// ---------------------------------------------------------------------------
// jobs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn notify_applies_configured_retry_policy() {
    let h = harness();
    let job = h
        .controller
        .notify("sync", json!({"all": true}), Some(Duration::from_secs(3)), Some(7))
        .await
        .expect("notify");
    assert_eq!(job.delay_ms, 3_000);
    assert_eq!(job.policy.attempts, 7);
    assert_eq!(job.policy.backoff, Config::default().jobs.backoff);
}

#[tokio::test]
async fn notify_rejects_unknown_job_types() {
    let h = harness();
    let err = h
        .controller
        .notify("reindex", json!({}), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::UnknownJobType(ref t) if t == "reindex"));
    assert!(h.queue.jobs().is_empty());
}

#[tokio::test]
async fn process_rejects_unknown_types_and_bad_payloads() {
    let h = harness();
    let job = h
        .queue
        .create(NewJob::new("reindex", json!({})))
        .await
        .expect("create");
    let err = h.controller.process(job).await.unwrap_err();
    assert!(matches!(err, DaemonError::UnknownJobType(ref t) if t == "reindex"));
    assert!(!err.is_retryable());

    let job = h
        .queue
        .create(NewJob::new("unsubscribe", json!({"name": "lib"})))
        .await
        .expect("create");
    let err = h.controller.process(job).await.unwrap_err();
    assert!(matches!(err, DaemonError::Payload(_)));
}

#[tokio::test]
async fn process_dispatches_sync_jobs() {
    let h = harness();
    stale(&h, "lib", &["record"]).await;
    let job = h
        .queue
        .create(NewJob::new("sync", json!({"id": "lib"})))
        .await
        .expect("create");
    h.controller.process(job).await.expect("sync job");
    assert_eq!(version(&h, "lib").await, 6);
}

// ---------------------------------------------------------------------------
// lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_syncs_everything_then_consumes_jobs() {
    let h = harness();
    stale(&h, "lib", &["record"]).await;

    h.controller.start(None).await.expect("start");
    assert_eq!(version(&h, "lib").await, 6);
    assert_eq!(*h.calls.lock().unwrap(), vec!["lib v6".to_string()]);

    h.source.push(&"lib".into(), RemoteEntry::live("other", json!({})));
    h.controller
        .notify_sync(SyncRequest::one("lib"), None)
        .await
        .expect("notify");
    let calls = Arc::clone(&h.calls);
    eventually("queued sync", || calls.lock().unwrap().len() == 2).await;

    h.controller.stop().await.expect("stop");
    assert!(h.controller.start(None).await.is_err());
}

#[tokio::test]
async fn interrupted_jobs_are_retried_on_next_start() {
    let dir = tempfile::TempDir::new().expect("tmp");
    let journal = dir.path().join("jobs.json");

    // A previous process died mid-job.
    {
        let queue = MemoryQueue::open(&journal).expect("open");
        queue
            .create(NewJob::new("sync", json!({"id": "lib"})))
            .await
            .expect("create");
        queue
            .process(
                "sync",
                1,
                Arc::new(|_| {
                    async {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(())
                    }
                    .boxed()
                }),
            )
            .await
            .expect("process");
        eventually("job to go active", || {
            queue.jobs().iter().any(|j| j.state == JobState::Active)
        })
        .await;
        let err = queue.shutdown(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, DaemonError::ShutdownTimeout { .. }));
    }

    let h = harness_with(Config::default(), MemoryQueue::open(&journal).expect("reopen"));
    assert_eq!(h.queue.interrupted().await.unwrap().len(), 1);
    stale(&h, "lib", &["record"]).await;

    h.controller.start(Some(&["sync"][..])).await.expect("start");
    // Initial sync already caught up; the re-run job finds nothing new.
    let queue = h.queue.clone();
    eventually("interrupted job to finish", || queue.jobs().is_empty()).await;
    assert_eq!(h.queue.counts().await.completed, 1);
    h.controller.stop().await.expect("stop");
}

#[tokio::test(start_paused = true)]
async fn stop_reports_jobs_that_outlive_the_timeout() {
    let config = Config {
        shutdown_timeout_ms: 50,
        ..Config::default()
    };
    let h = harness_with(config, MemoryQueue::new());
    h.controller.start(None).await.expect("start");
    stale(&h, "lib", &["slow"]).await;
    h.controller
        .notify_sync(SyncRequest::one("lib"), None)
        .await
        .expect("notify");
    let controller = h.controller.clone();
    eventually("sync to take the lock", || {
        controller.locks().is_locked(&SubscriptionId::from("lib"))
    })
    .await;

    let err = h.controller.stop().await.unwrap_err();
    assert!(matches!(
        err,
        DaemonError::ShutdownTimeout {
            component: "job queue",
            ..
        }
    ));
}

#[tokio::test]
async fn live_mode_registers_survivors_and_turns_updates_into_sync_jobs() {
    let config = Config {
        live: true,
        ..Config::default()
    };
    let h = harness_with(config, MemoryQueue::new());
    stale(&h, "lib", &["record"]).await;
    let (transport, mut server) = MemoryTransport::pair();
    let controller = h.controller.clone().with_transport(Box::new(transport));

    controller.start(None).await.expect("start");
    let sent = tokio::time::timeout(Duration::from_secs(5), server.next_sent())
        .await
        .expect("registration in time");
    assert_eq!(
        sent,
        Some(ClientMessage::CreateSubscriptions {
            subscriptions: vec![TopicBatch {
                api_key: Some("secret".to_string()),
                topics: vec!["/users/lib".to_string()],
            }]
        })
    );
    server.push(ServerMessage::SubscriptionsCreated {
        subscriptions: vec![TopicBatch {
            api_key: Some("secret".to_string()),
            topics: vec!["/users/lib".to_string()],
        }],
        errors: Vec::new(),
    });

    h.source.push(&"lib".into(), RemoteEntry::live("new", json!({})));
    server.push(ServerMessage::TopicUpdated {
        topic: "/users/lib".to_string(),
        version: Some(7),
    });
    let calls = Arc::clone(&h.calls);
    eventually("sync triggered by the stream", || {
        calls.lock().unwrap().last().map(String::as_str) == Some("lib v7")
    })
    .await;

    let status = controller.status().await.expect("status");
    assert!(status.live);
    let listener = status.listener.expect("listener status");
    assert!(listener.connected);
    assert_eq!(listener.registrations.len(), 1);

    controller.stop().await.expect("stop");
}
