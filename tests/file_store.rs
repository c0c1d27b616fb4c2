//! File Store Integration Tests
//!
//! Runs the reconciler against the on-disk store and checks that the
//! lifecycle survives reopening the store, as it does across CLI calls.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use sbomer::adapters::MemoryJobRunner;
use sbomer::core::{
    FileStore, OrchestratorSettings, PipelineOrchestrator, ReconcileOutcome, Reconciler,
    RequestStore,
};
use sbomer::domain::{job_name, Phase, RequestStatus};
use tempfile::TempDir;

async fn reconciler(root: &Path, runner: Arc<MemoryJobRunner>) -> (Reconciler, Arc<FileStore>) {
    let store = Arc::new(FileStore::open(root).await.unwrap());
    let orchestrator =
        PipelineOrchestrator::new(runner, store.clone(), OrchestratorSettings::default());
    (Reconciler::new(store.clone(), orchestrator), store)
}

#[tokio::test]
async fn test_lifecycle_survives_reopen() {
    let temp = TempDir::new().unwrap();
    let runner = Arc::new(MemoryJobRunner::new());

    let request_id = {
        let (reconciler, _store) = reconciler(temp.path(), runner.clone()).await;
        let request = reconciler.submit("build-1", BTreeMap::new()).await.unwrap();
        reconciler.reconcile(request.id).await.unwrap();
        request.id
    };

    // A fresh process sees the same request and job reference
    let (reconciler, store) = reconciler(temp.path(), runner.clone()).await;
    assert_eq!(
        reconciler.submit("build-1", BTreeMap::new()).await.unwrap().id,
        request_id
    );
    let job = store
        .find_job_ref(&job_name(request_id, Phase::Init, 0))
        .await
        .unwrap();
    assert_eq!(job.map(|j| j.request_id), Some(request_id));

    let outcome = reconciler.reconcile(request_id).await.unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Unchanged {
            status: RequestStatus::Initializing
        }
    );
    assert_eq!(runner.created_count(), 1);

    runner.succeed(&job_name(request_id, Phase::Init, 0));
    reconciler.reconcile(request_id).await.unwrap();
    reconciler.reconcile(request_id).await.unwrap();
    runner.succeed(&job_name(request_id, Phase::Generate, 0));
    reconciler.reconcile(request_id).await.unwrap();

    let stored = store.get(request_id).await.unwrap().unwrap();
    assert_eq!(stored.status, RequestStatus::Finished);
    assert_eq!(stored.revision, 4);

    let events = store.events(request_id).await.unwrap();
    assert_eq!(events.len(), 5);
    for pair in events.windows(2) {
        assert_eq!(pair[1].parent, Some(pair[0].id));
    }
    assert_eq!(store.generations(request_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_delivery_marks_persist() {
    let temp = TempDir::new().unwrap();
    let runner = Arc::new(MemoryJobRunner::new());
    let (reconciler, store) = reconciler(temp.path(), runner).await;

    let request = reconciler.submit("build-2", BTreeMap::new()).await.unwrap();
    reconciler.reconcile(request.id).await.unwrap();

    let pending = store.undelivered_events().await.unwrap();
    assert_eq!(pending.len(), 2);
    store.mark_delivered(pending[0].id).await.unwrap();
    store.mark_delivered(pending[0].id).await.unwrap();

    let reopened = FileStore::open(temp.path()).await.unwrap();
    let pending_after = reopened.undelivered_events().await.unwrap();
    assert_eq!(pending_after.len(), 1);
    assert_eq!(pending_after[0].id, pending[1].id);
}

#[tokio::test]
async fn test_failed_snapshot_write_leaves_no_event_behind() {
    let temp = TempDir::new().unwrap();
    let runner = Arc::new(MemoryJobRunner::new());
    let (reconciler, store) = reconciler(temp.path(), runner.clone()).await;
    let request = reconciler.submit("build-3", BTreeMap::new()).await.unwrap();

    // A directory in place of the snapshot's temporary file fails the write
    let blocker = temp
        .path()
        .join("requests")
        .join(request.id.to_string())
        .join("request.json.tmp");
    std::fs::create_dir(&blocker).unwrap();
    assert!(reconciler.reconcile(request.id).await.is_err());

    let stored = store.get(request.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RequestStatus::New);
    let events = store.events(request.id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, RequestStatus::New);
    assert_eq!(store.undelivered_events().await.unwrap().len(), 1);

    // The redone pass produces the only INITIALIZING event
    std::fs::remove_dir(&blocker).unwrap();
    let outcome = reconciler.reconcile(request.id).await.unwrap();
    assert!(matches!(
        outcome,
        ReconcileOutcome::Transitioned {
            to: RequestStatus::Initializing,
            ..
        }
    ));

    let events = store.events(request.id).await.unwrap();
    assert_eq!(
        events.iter().map(|e| e.status).collect::<Vec<_>>(),
        vec![RequestStatus::New, RequestStatus::Initializing]
    );
    assert_eq!(events[1].parent, Some(events[0].id));
    assert_eq!(store.undelivered_events().await.unwrap().len(), 2);
    assert_eq!(runner.created_count(), 1);
}
