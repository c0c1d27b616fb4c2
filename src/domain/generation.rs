//! Summaries of individual pipeline job executions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::{JobState, PipelineJobRef};
use super::request::Phase;

/// Summary of one pipeline job execution, owned by its request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    /// Derived from the job id, so re-recording the same execution is an upsert
    pub id: String,

    pub request_id: Uuid,
    pub phase: Phase,
    pub job_id: String,

    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,

    /// Terminal job state (`succeeded` or `failed`)
    pub status: JobState,

    /// Failure detail reported by the job runner
    pub reason: Option<String>,
}

impl GenerationRecord {
    /// Record a finished job execution
    pub fn finished(job: &PipelineJobRef, status: JobState, reason: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("gen-{}", job.job_id),
            request_id: job.request_id,
            phase: job.phase,
            job_id: job.job_id.clone(),
            created: job.created_at,
            updated: now,
            finished: Some(now),
            status,
            reason,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobState::Succeeded
    }
}
