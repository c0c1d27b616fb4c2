//! Persistence of requests, job references, generation records and events.
//!
//! The store is the only shared mutable state. Status changes go through
//! [`RequestStore::commit`], a compare-and-swap on the request revision that
//! writes the new request, its generation record and its event together.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{EventRecord, GenerationRecord, GenerationRequest, Phase, PipelineJobRef};

/// Errors that can occur in a request store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Request not found: {0}")]
    NotFound(Uuid),

    #[error("Request already exists: {0}")]
    AlreadyExists(Uuid),

    #[error("Stale write for request {id}: expected revision {expected}, found {actual}")]
    Conflict { id: Uuid, expected: u64, actual: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One atomic status change
#[derive(Debug, Clone)]
pub struct Commit {
    /// Revision the decision was based on
    pub previous_revision: u64,

    /// Request after the change (revision already bumped)
    pub request: GenerationRequest,

    /// Execution summary produced by this pass, if any
    pub generation: Option<GenerationRecord>,

    /// Event announcing the change
    pub event: EventRecord,
}

/// Storage for generation requests and everything they own
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Persist a new request together with its creation event
    async fn insert(&self, request: &GenerationRequest, event: &EventRecord) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<GenerationRequest>, StoreError>;

    async fn find_by_build_id(&self, build_id: &str) -> Result<Option<GenerationRequest>, StoreError>;

    /// All requests, oldest first
    async fn list(&self) -> Result<Vec<GenerationRequest>, StoreError>;

    async fn job_ref(
        &self,
        request_id: Uuid,
        phase: Phase,
        attempt: u32,
    ) -> Result<Option<PipelineJobRef>, StoreError>;

    async fn put_job_ref(&self, job: &PipelineJobRef) -> Result<(), StoreError>;

    /// Correlate an external job id back to its request phase
    async fn find_job_ref(&self, job_id: &str) -> Result<Option<PipelineJobRef>, StoreError>;

    /// Apply a status change if the request is still at `previous_revision`
    async fn commit(&self, commit: Commit) -> Result<(), StoreError>;

    /// Generation records of a request, oldest first
    async fn generations(&self, request_id: Uuid) -> Result<Vec<GenerationRecord>, StoreError>;

    /// Events of a request in causal order
    async fn events(&self, request_id: Uuid) -> Result<Vec<EventRecord>, StoreError>;

    async fn last_event(&self, request_id: Uuid) -> Result<Option<EventRecord>, StoreError> {
        Ok(self.events(request_id).await?.pop())
    }

    /// Events not yet acknowledged by the notification channel, oldest first
    async fn undelivered_events(&self) -> Result<Vec<EventRecord>, StoreError>;

    async fn mark_delivered(&self, event_id: Uuid) -> Result<(), StoreError>;
}

/// Insert or replace a generation record by id
pub(crate) fn upsert_generation(records: &mut Vec<GenerationRecord>, record: GenerationRecord) {
    match records.iter_mut().find(|r| r.id == record.id) {
        Some(existing) => *existing = record,
        None => records.push(record),
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    requests: HashMap<Uuid, GenerationRequest>,
    jobs: Vec<PipelineJobRef>,
    generations: HashMap<Uuid, Vec<GenerationRecord>>,
    events: HashMap<Uuid, Vec<EventRecord>>,
    delivered: HashSet<Uuid>,
    commits: usize,
}

/// Mutex-guarded in-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful status commits
    pub fn commit_count(&self) -> usize {
        self.lock().commits
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn insert(&self, request: &GenerationRequest, event: &EventRecord) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.requests.contains_key(&request.id) {
            return Err(StoreError::AlreadyExists(request.id));
        }
        state.requests.insert(request.id, request.clone());
        state.events.entry(request.id).or_default().push(event.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<GenerationRequest>, StoreError> {
        Ok(self.lock().requests.get(&id).cloned())
    }

    async fn find_by_build_id(&self, build_id: &str) -> Result<Option<GenerationRequest>, StoreError> {
        Ok(self
            .lock()
            .requests
            .values()
            .find(|r| r.build_id == build_id)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<GenerationRequest>, StoreError> {
        let mut requests: Vec<_> = self.lock().requests.values().cloned().collect();
        requests.sort_by_key(|r| r.created_at);
        Ok(requests)
    }

    async fn job_ref(
        &self,
        request_id: Uuid,
        phase: Phase,
        attempt: u32,
    ) -> Result<Option<PipelineJobRef>, StoreError> {
        Ok(self
            .lock()
            .jobs
            .iter()
            .find(|j| j.request_id == request_id && j.phase == phase && j.attempt == attempt)
            .cloned())
    }

    async fn put_job_ref(&self, job: &PipelineJobRef) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.jobs.retain(|j| {
            !(j.request_id == job.request_id && j.phase == job.phase && j.attempt == job.attempt)
        });
        state.jobs.push(job.clone());
        Ok(())
    }

    async fn find_job_ref(&self, job_id: &str) -> Result<Option<PipelineJobRef>, StoreError> {
        Ok(self.lock().jobs.iter().find(|j| j.job_id == job_id).cloned())
    }

    async fn commit(&self, commit: Commit) -> Result<(), StoreError> {
        let mut state = self.lock();
        let id = commit.request.id;

        let actual = state
            .requests
            .get(&id)
            .map(|r| r.revision)
            .ok_or(StoreError::NotFound(id))?;
        if actual != commit.previous_revision {
            return Err(StoreError::Conflict {
                id,
                expected: commit.previous_revision,
                actual,
            });
        }

        state.requests.insert(id, commit.request);
        if let Some(record) = commit.generation {
            upsert_generation(state.generations.entry(id).or_default(), record);
        }
        state.events.entry(id).or_default().push(commit.event);
        state.commits += 1;
        Ok(())
    }

    async fn generations(&self, request_id: Uuid) -> Result<Vec<GenerationRecord>, StoreError> {
        Ok(self
            .lock()
            .generations
            .get(&request_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn events(&self, request_id: Uuid) -> Result<Vec<EventRecord>, StoreError> {
        Ok(self.lock().events.get(&request_id).cloned().unwrap_or_default())
    }

    async fn undelivered_events(&self) -> Result<Vec<EventRecord>, StoreError> {
        let state = self.lock();
        let mut pending: Vec<EventRecord> = state
            .events
            .values()
            .flatten()
            .filter(|e| !state.delivered.contains(&e.id))
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.created);
        Ok(pending)
    }

    async fn mark_delivered(&self, event_id: Uuid) -> Result<(), StoreError> {
        self.lock().delivered.insert(event_id);
        Ok(())
    }
}
