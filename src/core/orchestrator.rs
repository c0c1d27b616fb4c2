//! Pipeline orchestrator.
//!
//! Maps one lifecycle phase to exactly one external job and interprets the
//! job's reported state. Every job runner call carries a deadline; a timeout
//! or transport error is an inconclusive observation, never a failure.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::adapters::{JobRunner, JobSpec, RunnerError, RunnerJobState};
use crate::domain::{job_name, GenerationRecord, GenerationRequest, JobState, Phase, PipelineJobRef};

use super::state::Observation;
use super::store::{RequestStore, StoreError};

/// Timeouts for job runner interaction
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    /// Deadline for every create/status call
    pub call_timeout: Duration,

    /// How long a freshly created job may read as "not found"
    pub visibility_grace: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            visibility_grace: Duration::from_secs(60),
        }
    }
}

/// Orchestrator observation plus the generation record it produced
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseReport {
    pub observation: Observation,

    /// Set when the phase's job reached a terminal state
    pub record: Option<GenerationRecord>,
}

impl PhaseReport {
    fn observation(observation: Observation) -> Self {
        Self {
            observation,
            record: None,
        }
    }
}

/// Creates and observes the external job of each request phase
pub struct PipelineOrchestrator {
    runner: Arc<dyn JobRunner>,
    store: Arc<dyn RequestStore>,
    settings: OrchestratorSettings,
}

impl PipelineOrchestrator {
    pub fn new(
        runner: Arc<dyn JobRunner>,
        store: Arc<dyn RequestStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            runner,
            store,
            settings,
        }
    }

    pub fn runner(&self) -> &dyn JobRunner {
        self.runner.as_ref()
    }

    /// Ensure the phase's job exists and report what it is doing.
    ///
    /// Idempotent: an existing job reference for (request, phase, attempt)
    /// is observed instead of creating another job. Creation is keyed by a
    /// deterministic job name, so a create retried after a lost answer is
    /// adopted rather than duplicated.
    #[instrument(skip(self, request), fields(request_id = %request.id, phase = %phase))]
    pub async fn ensure_job_for_phase(
        &self,
        request: &GenerationRequest,
        phase: Phase,
    ) -> Result<PhaseReport, StoreError> {
        if let Some(job) = self.store.job_ref(request.id, phase, request.attempt).await? {
            debug!(job_id = %job.job_id, "Job already exists, observing");
            return Ok(self.observe(&job).await);
        }

        let spec = JobSpec {
            name: job_name(request.id, phase, request.attempt),
            request_id: request.id,
            build_id: request.build_id.clone(),
            phase,
            attempt: request.attempt,
            params: job_params(request),
        };

        match self.call(self.runner.create_job(&spec)).await {
            Ok(job_id) => {
                let job = PipelineJobRef::new(request.id, phase, request.attempt, job_id);
                self.store.put_job_ref(&job).await?;
                info!(job_id = %job.job_id, runner = self.runner.name(), "Created job");
                Ok(PhaseReport::observation(Observation::Started { job }))
            }
            Err(RunnerError::AlreadyExists { job_id }) => {
                // A previous create went through but its answer was lost
                let job = PipelineJobRef::new(request.id, phase, request.attempt, job_id);
                self.store.put_job_ref(&job).await?;
                info!(job_id = %job.job_id, "Adopted existing job");
                Ok(self.observe(&job).await)
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Job creation inconclusive");
                Ok(PhaseReport::observation(Observation::Inconclusive {
                    reason: e.to_string(),
                }))
            }
            Err(e) => {
                warn!(error = %e, "Job creation rejected");
                Ok(PhaseReport::observation(Observation::CreateFailed {
                    reason: e.to_string(),
                }))
            }
        }
    }

    /// Read-only observation of an existing job
    #[instrument(skip(self, job), fields(job_id = %job.job_id, phase = %job.phase))]
    pub async fn observe(&self, job: &PipelineJobRef) -> PhaseReport {
        let report = match self.call(self.runner.job_status(&job.job_id)).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Job status inconclusive");
                return PhaseReport::observation(Observation::Inconclusive {
                    reason: e.to_string(),
                });
            }
        };

        let state = match report.state {
            RunnerJobState::Pending => JobState::NotStarted,
            RunnerJobState::Running => JobState::Running,
            RunnerJobState::Succeeded => JobState::Succeeded,
            RunnerJobState::Failed => JobState::Failed,
            RunnerJobState::NotFound => {
                let age = Utc::now()
                    .signed_duration_since(job.created_at)
                    .to_std()
                    .unwrap_or_default();
                if age < self.settings.visibility_grace {
                    debug!(?age, "Job not visible yet, treating as running");
                    JobState::Running
                } else {
                    warn!(?age, "Job disappeared from the runner");
                    return self.finished(
                        job,
                        JobState::Failed,
                        Some(format!("{} job {} not found on the runner", job.phase, job.job_id)),
                    );
                }
            }
        };

        if state.is_finished() {
            return self.finished(job, state, report.detail);
        }

        PhaseReport::observation(Observation::Observed {
            job: job.clone(),
            state,
            detail: report.detail,
        })
    }

    fn finished(&self, job: &PipelineJobRef, state: JobState, detail: Option<String>) -> PhaseReport {
        let reason = match state {
            JobState::Failed => detail.clone(),
            _ => None,
        };
        PhaseReport {
            record: Some(GenerationRecord::finished(job, state, reason)),
            observation: Observation::Observed {
                job: job.clone(),
                state,
                detail,
            },
        }
    }

    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, RunnerError>>,
    ) -> Result<T, RunnerError> {
        tokio::time::timeout(self.settings.call_timeout, fut)
            .await
            .unwrap_or(Err(RunnerError::Timeout(self.settings.call_timeout)))
    }
}

/// Parameters forwarded to the job: request metadata minus routing hints
fn job_params(request: &GenerationRequest) -> BTreeMap<String, String> {
    request
        .metadata
        .iter()
        .filter(|(key, _)| key.as_str() != crate::domain::WORKER_METADATA_KEY)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryJobRunner;
    use crate::core::store::MemoryStore;

    fn setup(settings: OrchestratorSettings) -> (PipelineOrchestrator, Arc<MemoryJobRunner>) {
        let runner = Arc::new(MemoryJobRunner::new());
        let store = Arc::new(MemoryStore::new());
        let orchestrator = PipelineOrchestrator::new(runner.clone(), store, settings);
        (orchestrator, runner)
    }

    #[test]
    fn test_job_params_skip_routing_hints() {
        let request = GenerationRequest::new("b", BTreeMap::new())
            .with_metadata("worker", "index")
            .with_metadata("product", "rhel");

        let params = job_params(&request);
        assert_eq!(params.len(), 1);
        assert_eq!(params.get("product").map(String::as_str), Some("rhel"));
    }

    #[tokio::test]
    async fn test_missing_job_past_grace_fails() {
        let (orchestrator, _runner) = setup(OrchestratorSettings {
            call_timeout: Duration::from_secs(1),
            visibility_grace: Duration::ZERO,
        });
        let job = PipelineJobRef::new(uuid::Uuid::new_v4(), Phase::Init, 0, "gone");

        let report = orchestrator.observe(&job).await;
        let record = report.record.expect("terminal observation records the execution");
        assert_eq!(record.status, JobState::Failed);
        assert!(record.reason.unwrap().contains("not found"));
    }
}
