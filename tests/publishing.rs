//! Publishing Integration Tests
//!
//! Status changes are committed before they are published; a failing
//! channel never rolls them back, and undelivered events are redelivered
//! until the channel accepts them. Workers only see events routed to them.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sbomer::adapters::MemoryJobRunner;
use sbomer::core::{
    MemoryStore, OrchestratorSettings, PipelineOrchestrator, Reconciler, RequestStore, RetryPolicy,
};
use sbomer::domain::{
    job_name, EventRecord, GenerationRequest, Phase, RequestStatus, WORKER_METADATA_KEY,
};
use sbomer::notify::{
    ChannelError, EventPublisher, IndexWorker, LocalChannel, NotificationChannel, Worker,
    WorkerDispatcher,
};
use tempfile::TempDir;
use tokio::sync::watch;
use uuid::Uuid;

/// Channel that can be switched off, recording what it accepted
#[derive(Default)]
struct SwitchableChannel {
    down: Mutex<bool>,
    accepted: Mutex<Vec<EventRecord>>,
}

impl SwitchableChannel {
    fn set_down(&self, down: bool) {
        *self.down.lock().unwrap() = down;
    }

    fn accepted(&self) -> Vec<EventRecord> {
        self.accepted.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationChannel for SwitchableChannel {
    fn name(&self) -> &str {
        "switchable"
    }

    async fn send(&self, event: &EventRecord) -> Result<(), ChannelError> {
        if *self.down.lock().unwrap() {
            return Err(ChannelError::Delivery("endpoint down".into()));
        }
        self.accepted.lock().unwrap().push(event.clone());
        Ok(())
    }
}

fn no_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 1,
        initial_delay_ms: 1,
        max_delay_ms: 1,
        backoff_multiplier: 1.0,
    }
}

fn reconciler(store: Arc<MemoryStore>, runner: Arc<MemoryJobRunner>) -> Reconciler {
    let orchestrator =
        PipelineOrchestrator::new(runner, store.clone(), OrchestratorSettings::default());
    Reconciler::new(store, orchestrator)
}

#[tokio::test]
async fn test_failed_delivery_keeps_state_and_is_redelivered() {
    let store = Arc::new(MemoryStore::new());
    let runner = Arc::new(MemoryJobRunner::new());
    let channel = Arc::new(SwitchableChannel::default());
    channel.set_down(true);

    let (_stop, stop_rx) = watch::channel(false);
    let (publisher, _task) = EventPublisher::new(store.clone(), channel.clone())
        .with_retry_policy(no_retry())
        .with_redelivery_interval(Duration::from_secs(3600))
        .spawn(stop_rx);
    let reconciler = reconciler(store.clone(), runner).with_publisher(publisher.clone());

    let request = reconciler.submit("build-1", BTreeMap::new()).await.unwrap();
    reconciler.reconcile(request.id).await.unwrap();
    publisher.flush().await;

    // Nothing delivered, but the transition stands
    assert!(channel.accepted().is_empty());
    let stored = store.get(request.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RequestStatus::Initializing);
    assert_eq!(store.undelivered_events().await.unwrap().len(), 2);

    channel.set_down(false);
    assert_eq!(publisher.redeliver().await, 2);

    let accepted = channel.accepted();
    assert_eq!(
        accepted.iter().map(|e| e.status).collect::<Vec<_>>(),
        vec![RequestStatus::New, RequestStatus::Initializing]
    );
    assert_eq!(accepted[1].parent, Some(accepted[0].id));
    assert!(store.undelivered_events().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_later_events_wait_for_earlier_ones() {
    let store = Arc::new(MemoryStore::new());
    let runner = Arc::new(MemoryJobRunner::new());
    let channel = Arc::new(SwitchableChannel::default());

    let (_stop, stop_rx) = watch::channel(false);
    let (publisher, _task) = EventPublisher::new(store.clone(), channel.clone())
        .with_retry_policy(no_retry())
        .with_redelivery_interval(Duration::from_secs(3600))
        .spawn(stop_rx);
    let reconciler = reconciler(store.clone(), runner.clone()).with_publisher(publisher.clone());

    let request = reconciler.submit("build-1", BTreeMap::new()).await.unwrap();
    publisher.flush().await;
    assert_eq!(channel.accepted().len(), 1);

    // INITIALIZING is lost, INITIALIZED must not overtake it
    channel.set_down(true);
    reconciler.reconcile(request.id).await.unwrap();
    publisher.flush().await;
    channel.set_down(false);

    runner.succeed(&job_name(request.id, Phase::Init, 0));
    reconciler.reconcile(request.id).await.unwrap();
    publisher.flush().await;
    assert_eq!(channel.accepted().len(), 1);

    publisher.redeliver().await;
    let statuses: Vec<_> = channel.accepted().iter().map(|e| e.status).collect();
    assert_eq!(
        statuses,
        vec![
            RequestStatus::New,
            RequestStatus::Initializing,
            RequestStatus::Initialized
        ]
    );
}

/// Worker counting the events it handled
struct CountingWorker {
    key: &'static str,
    handled: Mutex<Vec<Uuid>>,
}

impl CountingWorker {
    fn new(key: &'static str) -> Self {
        Self {
            key,
            handled: Mutex::new(Vec::new()),
        }
    }

    fn handled(&self) -> Vec<Uuid> {
        self.handled.lock().unwrap().clone()
    }
}

#[async_trait]
impl Worker for CountingWorker {
    fn interest_key(&self) -> &str {
        self.key
    }

    async fn handle(&self, event: &EventRecord) -> Result<()> {
        self.handled.lock().unwrap().push(event.id);
        Ok(())
    }
}

/// Worker that always fails
struct BrokenWorker;

#[async_trait]
impl Worker for BrokenWorker {
    fn interest_key(&self) -> &str {
        "index"
    }

    async fn handle(&self, _event: &EventRecord) -> Result<()> {
        anyhow::bail!("disk full")
    }
}

#[tokio::test]
async fn test_end_to_end_worker_routing() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let runner = Arc::new(MemoryJobRunner::new());

    let (local, events) = LocalChannel::new(16);

    let index = Arc::new(IndexWorker::in_home(temp.path()));
    let audit = Arc::new(CountingWorker::new("audit"));
    let (dispatcher_stop, dispatcher_rx) = watch::channel(false);
    let dispatcher = WorkerDispatcher::new()
        .with_worker(index.clone())
        .with_worker(audit.clone())
        .with_worker(Arc::new(BrokenWorker))
        .spawn(events, dispatcher_rx);

    let (publisher_stop, publisher_rx) = watch::channel(false);
    let (publisher, publisher_task) = EventPublisher::new(store.clone(), Arc::new(local))
        .with_redelivery_interval(Duration::from_secs(3600))
        .spawn(publisher_rx);
    let reconciler = reconciler(store.clone(), runner.clone()).with_publisher(publisher.clone());

    let routed: BTreeMap<String, String> =
        [(WORKER_METADATA_KEY.to_string(), "index".to_string())].into_iter().collect();
    let indexed = reconciler.submit("build-indexed", routed).await.unwrap();
    let plain = reconciler.submit("build-plain", BTreeMap::new()).await.unwrap();

    for request in [&indexed, &plain] {
        reconciler.reconcile(request.id).await.unwrap();
        runner.succeed(&job_name(request.id, Phase::Init, 0));
        reconciler.reconcile(request.id).await.unwrap();
        reconciler.reconcile(request.id).await.unwrap();
        runner.succeed(&job_name(request.id, Phase::Generate, 0));
        reconciler.reconcile(request.id).await.unwrap();
        assert_eq!(
            store.get(request.id).await.unwrap().unwrap().status,
            RequestStatus::Finished
        );
    }

    publisher.flush().await;
    publisher_stop.send(true).unwrap();
    publisher_task.await.unwrap();
    dispatcher_stop.send(true).unwrap();
    dispatcher.await.unwrap();

    // Only the routed request reached the index, once
    let entries = index.entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].build_id, "build-indexed");
    assert_eq!(entries[0].generations.len(), 2);

    // Nothing was routed to the audit worker
    assert!(audit.handled().is_empty());

    // A failing worker does not touch request state
    assert_eq!(
        store.get(indexed.id).await.unwrap().unwrap().status,
        RequestStatus::Finished
    );
}

#[tokio::test]
async fn test_redelivered_event_is_indexed_once() {
    let temp = TempDir::new().unwrap();
    let worker = IndexWorker::in_home(temp.path());

    let request = GenerationRequest::new("build-3", BTreeMap::new())
        .with_metadata(WORKER_METADATA_KEY, "index")
        .with_status(RequestStatus::Finished);
    let event = EventRecord::for_transition(&request, None, Vec::new(), "done");

    let dispatcher = WorkerDispatcher::new().with_worker(Arc::new(worker));
    for _ in 0..3 {
        let mut tasks = tokio::task::JoinSet::new();
        assert_eq!(dispatcher.dispatch(&event, &mut tasks), 1);
        while tasks.join_next().await.is_some() {}
    }

    let entries = IndexWorker::in_home(temp.path()).entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].event_id, event.id);
}

#[tokio::test]
async fn test_backlog_larger_than_local_buffer_reaches_workers() {
    let store = Arc::new(MemoryStore::new());
    let routed: BTreeMap<String, String> =
        [(WORKER_METADATA_KEY.to_string(), "audit".to_string())].into_iter().collect();

    let mut stored = Vec::new();
    for n in 0..5 {
        let request = GenerationRequest::new(&format!("build-{}", n), routed.clone());
        let event = EventRecord::for_transition(&request, None, Vec::new(), "Request created");
        store.insert(&request, &event).await.unwrap();
        stored.push(event.id);
    }

    // Room for two events and no consumer yet
    let (local, events) = LocalChannel::new(2);
    let (_publisher_stop, publisher_rx) = watch::channel(false);
    let (publisher, _publisher_task) = EventPublisher::new(store.clone(), Arc::new(local))
        .with_redelivery_interval(Duration::from_secs(3600))
        .spawn(publisher_rx);
    let sweep = tokio::spawn(async move { publisher.redeliver().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.undelivered_events().await.unwrap().len(), 5);

    let audit = Arc::new(CountingWorker::new("audit"));
    let (dispatcher_stop, dispatcher_rx) = watch::channel(false);
    let dispatcher = WorkerDispatcher::new()
        .with_worker(audit.clone())
        .spawn(events, dispatcher_rx);

    sweep.await.unwrap();
    assert!(store.undelivered_events().await.unwrap().is_empty());

    let mut handled = audit.handled();
    handled.sort();
    stored.sort();
    assert_eq!(handled, stored);

    dispatcher_stop.send(true).unwrap();
    dispatcher.await.unwrap();
}
