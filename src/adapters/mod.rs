//! Adapter interfaces for external systems.
//!
//! Adapters provide a unified interface for the external pipeline job
//! runner and for outbound notification endpoints.

pub mod http;
pub mod memory;
pub mod process;
pub mod webhook;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::Phase;

pub use http::HttpJobRunner;
pub use memory::MemoryJobRunner;
pub use process::ProcessJobRunner;
pub use webhook::WebhookChannel;

/// Errors reported by a job runner
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RunnerError {
    /// The runner refused the job definition (definitive)
    #[error("Job rejected: {0}")]
    Rejected(String),

    /// A job with the same name already exists
    #[error("Job already exists: {job_id}")]
    AlreadyExists { job_id: String },

    /// The runner could not be reached or answered garbage (transient)
    #[error("Job runner unavailable: {0}")]
    Transport(String),

    /// The call did not finish within its deadline (transient)
    #[error("Job runner call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl RunnerError {
    /// Transient errors leave the observation inconclusive
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}

/// Definition of a job for one request phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Deterministic name (see [`crate::domain::job_name`])
    pub name: String,

    pub request_id: Uuid,
    pub build_id: String,
    pub phase: Phase,
    pub attempt: u32,

    /// Extra parameters forwarded to the job
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// Raw job state as reported by the runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerJobState {
    NotFound,
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Answer to a status query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub state: RunnerJobState,

    /// Failure detail or other human-readable status
    #[serde(default)]
    pub detail: Option<String>,
}

impl JobReport {
    pub fn new(state: RunnerJobState) -> Self {
        Self { state, detail: None }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Trait for external pipeline job runners
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Human-readable runner name
    fn name(&self) -> &str;

    /// Create a job, returning its stable external identifier
    async fn create_job(&self, spec: &JobSpec) -> Result<String, RunnerError>;

    /// Report the current state of a job
    async fn job_status(&self, job_id: &str) -> Result<JobReport, RunnerError>;
}
