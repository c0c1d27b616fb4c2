//! Reconciliation loop.
//!
//! One pass loads a request, evaluates the workflow gates, lets the
//! orchestrator ensure or observe the current phase's job, feeds the
//! observation to the state model and commits at most one status change.
//! Passes are level-triggered: running one again on unchanged state only
//! re-evaluates conditions.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{EventRecord, GenerationRecord, GenerationRequest, RequestStatus};
use crate::notify::PublisherHandle;

use super::conditions::{Gate, Workflow};
use super::orchestrator::PipelineOrchestrator;
use super::state::{self, StateError, Transition};
use super::store::{upsert_generation, Commit, RequestStore, StoreError};

/// Errors that abort a reconciliation pass
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The request keeps its last known-good status
    #[error("Contract violation: {0}")]
    Contract(#[from] StateError),
}

/// What a single pass did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No request with this id
    Missing,

    /// A gating condition was unmet; nothing was touched
    Skipped { condition: &'static str },

    /// Observed, but no status change is due yet
    Unchanged { status: RequestStatus },

    /// A status change was committed and handed to the publisher
    Transitioned {
        from: RequestStatus,
        to: RequestStatus,
        event_id: Uuid,
    },

    /// The request moved on while this pass was deciding; nothing persisted
    Abandoned,
}

/// Drives generation requests through their lifecycle
pub struct Reconciler {
    store: Arc<dyn RequestStore>,
    orchestrator: PipelineOrchestrator,
    workflow: Workflow,
    publisher: Option<PublisherHandle>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn RequestStore>, orchestrator: PipelineOrchestrator) -> Self {
        Self {
            store,
            orchestrator,
            workflow: Workflow::default(),
            publisher: None,
        }
    }

    pub fn with_workflow(mut self, workflow: Workflow) -> Self {
        self.workflow = workflow;
        self
    }

    /// Without a publisher, committed events wait for a redelivery sweep
    pub fn with_publisher(mut self, publisher: PublisherHandle) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn store(&self) -> &Arc<dyn RequestStore> {
        &self.store
    }

    pub fn orchestrator(&self) -> &PipelineOrchestrator {
        &self.orchestrator
    }

    /// Create a request for `build_id`, or return the one that already exists
    #[instrument(skip(self, metadata))]
    pub async fn submit(
        &self,
        build_id: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<GenerationRequest, ReconcileError> {
        if let Some(existing) = self.store.find_by_build_id(build_id).await? {
            info!(request_id = %existing.id, status = %existing.status, "Request already exists");
            return Ok(existing);
        }

        let mut request = GenerationRequest::new(build_id, metadata);
        request.reason = Some("Request created".to_string());
        let event = EventRecord::for_transition(&request, None, Vec::new(), "Request created");

        self.store.insert(&request, &event).await?;
        info!(request_id = %request.id, "Request created");
        self.publish(event);

        Ok(request)
    }

    /// Operator retry of a failed request: back to `New` with a fresh attempt
    #[instrument(skip(self), fields(request_id = %id))]
    pub async fn retry(&self, id: Uuid) -> Result<GenerationRequest, ReconcileError> {
        let request = self.store.get(id).await?.ok_or(StoreError::NotFound(id))?;
        let transition = state::retry(request.status)?;

        let (next, _) = self.apply(&request, transition, None).await?;
        Ok(next)
    }

    /// Run one reconciliation pass for a request
    #[instrument(skip(self), fields(request_id = %id))]
    pub async fn reconcile(&self, id: Uuid) -> Result<ReconcileOutcome, ReconcileError> {
        let Some(request) = self.store.get(id).await? else {
            debug!("Request not found");
            return Ok(ReconcileOutcome::Missing);
        };

        let job = match request.status.phase() {
            Some(phase) => self.store.job_ref(id, phase, request.attempt).await?,
            None => None,
        };

        let phase = match self.workflow.evaluate(&request, job.as_ref()) {
            Gate::Open(phase) => phase,
            Gate::Closed { condition } => {
                debug!(status = %request.status, condition, "Condition unmet, skipping");
                return Ok(ReconcileOutcome::Skipped { condition });
            }
        };

        let report = self.orchestrator.ensure_job_for_phase(&request, phase).await?;

        let transition = match state::next_status(request.status, &report.observation) {
            Ok(Some(transition)) => transition,
            Ok(None) => {
                debug!(status = %request.status, "No transition due");
                return Ok(ReconcileOutcome::Unchanged {
                    status: request.status,
                });
            }
            Err(e) => {
                error!(status = %request.status, error = %e, "State model rejected observation");
                return Err(e.into());
            }
        };

        match self.apply(&request, transition, report.record).await {
            Ok((next, event_id)) => Ok(ReconcileOutcome::Transitioned {
                from: request.status,
                to: next.status,
                event_id,
            }),
            Err(StoreError::Conflict {
                expected, actual, ..
            }) => {
                warn!(expected, actual, "Request changed during the pass, abandoning decision");
                Ok(ReconcileOutcome::Abandoned)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Commit a transition with its record and event, then publish
    async fn apply(
        &self,
        request: &GenerationRequest,
        transition: Transition,
        record: Option<GenerationRecord>,
    ) -> Result<(GenerationRequest, Uuid), StoreError> {
        let parent = self.store.last_event(request.id).await?.map(|e| e.id);
        let mut generations = self.store.generations(request.id).await?;
        if let Some(record) = &record {
            upsert_generation(&mut generations, record.clone());
        }

        let mut next = request.clone();
        next.status = transition.to;
        next.reason = Some(transition.reason.clone());
        next.updated_at = Utc::now();
        next.revision += 1;
        if transition.from == RequestStatus::Failed && transition.to == RequestStatus::New {
            next.attempt += 1;
        }

        let event = EventRecord::for_transition(&next, parent, generations, &transition.reason);
        let event_id = event.id;

        self.store
            .commit(Commit {
                previous_revision: request.revision,
                request: next.clone(),
                generation: record,
                event: event.clone(),
            })
            .await?;

        match next.status {
            RequestStatus::Failed => error!(
                from = %transition.from,
                reason = %transition.reason,
                "Request failed"
            ),
            _ => info!(
                from = %transition.from,
                to = %transition.to,
                reason = %transition.reason,
                "Request transitioned"
            ),
        }

        self.publish(event);
        Ok((next, event_id))
    }

    fn publish(&self, event: EventRecord) {
        match &self.publisher {
            Some(publisher) => publisher.publish(event),
            None => debug!(event_id = %event.id, "No publisher attached, event left pending"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryJobRunner;
    use crate::core::orchestrator::OrchestratorSettings;
    use crate::core::store::MemoryStore;

    fn reconciler() -> (Reconciler, Arc<MemoryStore>, Arc<MemoryJobRunner>) {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(MemoryJobRunner::new());
        let orchestrator =
            PipelineOrchestrator::new(runner.clone(), store.clone(), OrchestratorSettings::default());
        (Reconciler::new(store.clone(), orchestrator), store, runner)
    }

    #[tokio::test]
    async fn test_submit_is_idempotent_per_build() {
        let (reconciler, store, _) = reconciler();

        let first = reconciler.submit("build-1", BTreeMap::new()).await.unwrap();
        let second = reconciler.submit("build-1", BTreeMap::new()).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.list().await.unwrap().len(), 1);
        assert_eq!(store.events(first.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_request() {
        let (reconciler, _, _) = reconciler();
        let outcome = reconciler.reconcile(Uuid::new_v4()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Missing);
    }

    #[tokio::test]
    async fn test_retry_rejected_unless_failed() {
        let (reconciler, _, _) = reconciler();
        let request = reconciler.submit("build-1", BTreeMap::new()).await.unwrap();

        let err = reconciler.retry(request.id).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Contract(_)));
    }
}
