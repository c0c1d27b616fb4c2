//! REST job runner client.
//!
//! Endpoints:
//! - `POST {base}/jobs` with a [`JobSpec`] body, answers `{"id": "..."}`
//!   (`409` with the same body when the job name already exists)
//! - `GET {base}/jobs/{id}` answers a [`JobReport`], `404` when unknown

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use super::{JobReport, JobRunner, JobSpec, RunnerError, RunnerJobState};

/// HTTP client for a remote job runner
pub struct HttpJobRunner {
    base_url: String,
    request_timeout: Duration,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct CreatedJob {
    id: String,
}

impl HttpJobRunner {
    /// Create a client for the runner at `base_url`
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout,
            client,
        })
    }

    fn jobs_url(&self) -> String {
        format!("{}/jobs", self.base_url)
    }

    fn map_transport(&self, error: reqwest::Error) -> RunnerError {
        if error.is_timeout() {
            RunnerError::Timeout(self.request_timeout)
        } else {
            RunnerError::Transport(error.to_string())
        }
    }
}

#[async_trait]
impl JobRunner for HttpJobRunner {
    fn name(&self) -> &str {
        "http"
    }

    async fn create_job(&self, spec: &JobSpec) -> Result<String, RunnerError> {
        let response = self
            .client
            .post(self.jobs_url())
            .json(spec)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        let status = response.status();
        match status {
            s if s.is_success() => {
                let created: CreatedJob = response
                    .json()
                    .await
                    .map_err(|e| RunnerError::Transport(format!("Invalid create response: {}", e)))?;
                Ok(created.id)
            }
            StatusCode::CONFLICT => {
                let existing: CreatedJob = response
                    .json()
                    .await
                    .map_err(|e| RunnerError::Transport(format!("Invalid conflict response: {}", e)))?;
                Err(RunnerError::AlreadyExists { job_id: existing.id })
            }
            s if s.is_client_error() => {
                let body = response.text().await.unwrap_or_default();
                Err(RunnerError::Rejected(format!("{}: {}", s, body.trim())))
            }
            s => Err(RunnerError::Transport(format!("Job runner answered {}", s))),
        }
    }

    async fn job_status(&self, job_id: &str) -> Result<JobReport, RunnerError> {
        let response = self
            .client
            .get(format!("{}/{}", self.jobs_url(), job_id))
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(JobReport::new(RunnerJobState::NotFound)),
            s if s.is_success() => response
                .json::<JobReport>()
                .await
                .map_err(|e| RunnerError::Transport(format!("Invalid status response: {}", e))),
            s => Err(RunnerError::Transport(format!("Job runner answered {}", s))),
        }
    }
}
