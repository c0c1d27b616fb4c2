//! In-process job runner.
//!
//! Jobs only change state when told to, which makes the runner useful for
//! dry runs and for driving the reconciler deterministically in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::{JobReport, JobRunner, JobSpec, RunnerError, RunnerJobState};

#[derive(Debug, Clone)]
struct MemoryJob {
    spec: JobSpec,
    state: RunnerJobState,
    detail: Option<String>,
    /// Hidden jobs read as `NotFound` (simulates a lagging runner API)
    visible: bool,
}

#[derive(Debug, Default)]
struct Behaviour {
    reject: Option<String>,
    unavailable: bool,
    hide_new_jobs: bool,
    latency: Option<Duration>,
}

/// Scriptable in-memory job runner
#[derive(Debug, Default)]
pub struct MemoryJobRunner {
    jobs: Mutex<HashMap<String, MemoryJob>>,
    behaviour: Mutex<Behaviour>,
    creates: AtomicUsize,
    status_calls: AtomicUsize,
}

impl MemoryJobRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every subsequent job creation with the given reason
    pub fn reject_jobs(&self, reason: impl Into<String>) {
        self.lock_behaviour().reject = Some(reason.into());
    }

    /// Make every call fail with a transport error
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock_behaviour().unavailable = unavailable;
    }

    /// Newly created jobs read as `NotFound` until [`reveal`](Self::reveal)
    pub fn hide_new_jobs(&self, hide: bool) {
        self.lock_behaviour().hide_new_jobs = hide;
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock_behaviour().latency = latency;
    }

    /// Make a hidden job visible
    pub fn reveal(&self, job_id: &str) {
        if let Some(job) = self.lock_jobs().get_mut(job_id) {
            job.visible = true;
        }
    }

    /// Forget a job entirely (as if the runner garbage-collected it)
    pub fn remove(&self, job_id: &str) {
        self.lock_jobs().remove(job_id);
    }

    /// Set a job's state
    pub fn set_state(&self, job_id: &str, state: RunnerJobState, detail: Option<&str>) {
        if let Some(job) = self.lock_jobs().get_mut(job_id) {
            job.state = state;
            job.detail = detail.map(str::to_string);
        }
    }

    /// Mark a job as succeeded
    pub fn succeed(&self, job_id: &str) {
        self.set_state(job_id, RunnerJobState::Succeeded, None);
    }

    /// Mark a job as failed with a detail message
    pub fn fail(&self, job_id: &str, detail: &str) {
        self.set_state(job_id, RunnerJobState::Failed, Some(detail));
    }

    /// Number of jobs actually created
    pub fn created_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Number of status queries answered
    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    /// Specs of all jobs created for a request
    pub fn jobs_for(&self, request_id: Uuid) -> Vec<JobSpec> {
        let mut specs: Vec<JobSpec> = self
            .lock_jobs()
            .values()
            .filter(|j| j.spec.request_id == request_id)
            .map(|j| j.spec.clone())
            .collect();
        specs.sort_by(|a, b| (a.attempt, a.phase).cmp(&(b.attempt, b.phase)));
        specs
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemoryJob>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_behaviour(&self) -> std::sync::MutexGuard<'_, Behaviour> {
        self.behaviour.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn simulate_call(&self) -> Result<(), RunnerError> {
        let (latency, unavailable) = {
            let behaviour = self.lock_behaviour();
            (behaviour.latency, behaviour.unavailable)
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if unavailable {
            return Err(RunnerError::Transport("memory runner unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobRunner for MemoryJobRunner {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_job(&self, spec: &JobSpec) -> Result<String, RunnerError> {
        self.simulate_call().await?;

        let (reject, hide) = {
            let behaviour = self.lock_behaviour();
            (behaviour.reject.clone(), behaviour.hide_new_jobs)
        };
        if let Some(reason) = reject {
            return Err(RunnerError::Rejected(reason));
        }

        let mut jobs = self.lock_jobs();
        if jobs.contains_key(&spec.name) {
            return Err(RunnerError::AlreadyExists {
                job_id: spec.name.clone(),
            });
        }

        jobs.insert(
            spec.name.clone(),
            MemoryJob {
                spec: spec.clone(),
                state: RunnerJobState::Pending,
                detail: None,
                visible: !hide,
            },
        );
        self.creates.fetch_add(1, Ordering::SeqCst);

        Ok(spec.name.clone())
    }

    async fn job_status(&self, job_id: &str) -> Result<JobReport, RunnerError> {
        self.simulate_call().await?;
        self.status_calls.fetch_add(1, Ordering::SeqCst);

        let report = match self.lock_jobs().get(job_id) {
            Some(job) if job.visible => JobReport {
                state: job.state,
                detail: job.detail.clone(),
            },
            _ => JobReport::new(RunnerJobState::NotFound),
        };
        Ok(report)
    }
}
