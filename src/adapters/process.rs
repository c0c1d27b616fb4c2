//! Local subprocess job runner.
//!
//! Each phase maps to a configured command line. Jobs are spawned in the
//! background; the request context is passed through environment variables
//! (`BUILD_ID`, `REQUEST_ID`, `PHASE`, `ATTEMPT`, `JOB_NAME`, plus one
//! `PARAM_<KEY>` per job parameter).

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::domain::Phase;

use super::{JobReport, JobRunner, JobSpec, RunnerError, RunnerJobState};

type JobTable = Arc<Mutex<HashMap<String, JobReport>>>;

/// Job runner spawning one local process per phase
pub struct ProcessJobRunner {
    init_command: Vec<String>,
    generate_command: Vec<String>,

    /// Wall-clock limit per job; the process is killed when exceeded
    job_timeout: Duration,

    jobs: JobTable,
}

impl ProcessJobRunner {
    /// Create a runner from the per-phase command lines
    pub fn new(init_command: Vec<String>, generate_command: Vec<String>) -> Self {
        Self {
            init_command,
            generate_command,
            job_timeout: Duration::from_secs(3600),
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Override the per-job wall-clock limit
    pub fn with_job_timeout(mut self, job_timeout: Duration) -> Self {
        self.job_timeout = job_timeout;
        self
    }

    fn command_for(&self, phase: Phase) -> &[String] {
        match phase {
            Phase::Init => &self.init_command,
            Phase::Generate => &self.generate_command,
        }
    }

    fn set_report(jobs: &JobTable, job_id: &str, report: JobReport) {
        let mut table = jobs.lock().unwrap_or_else(|e| e.into_inner());
        table.insert(job_id.to_string(), report);
    }
}

#[async_trait]
impl JobRunner for ProcessJobRunner {
    fn name(&self) -> &str {
        "process"
    }

    async fn create_job(&self, spec: &JobSpec) -> Result<String, RunnerError> {
        let argv = self.command_for(spec.phase);
        let Some((program, args)) = argv.split_first() else {
            return Err(RunnerError::Rejected(format!(
                "No command configured for phase '{}'",
                spec.phase
            )));
        };

        {
            let mut table = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            if table.contains_key(&spec.name) {
                return Err(RunnerError::AlreadyExists {
                    job_id: spec.name.clone(),
                });
            }
            table.insert(spec.name.clone(), JobReport::new(RunnerJobState::Running));
        }

        let mut command = Command::new(program);
        command
            .args(args)
            .env("REQUEST_ID", spec.request_id.to_string())
            .env("BUILD_ID", &spec.build_id)
            .env("PHASE", spec.phase.as_str())
            .env("ATTEMPT", spec.attempt.to_string())
            .env("JOB_NAME", &spec.name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &spec.params {
            command.env(format!("PARAM_{}", key.to_uppercase()), value);
        }

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let mut table = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
                table.remove(&spec.name);
                return Err(RunnerError::Rejected(format!(
                    "Failed to spawn '{}': {}",
                    program, e
                )));
            }
        };

        let job_id = spec.name.clone();
        debug!(%job_id, program = %program, "Spawned job process");

        let jobs = Arc::clone(&self.jobs);
        let job_timeout = self.job_timeout;
        let watched_id = job_id.clone();
        tokio::spawn(async move {
            let report = match timeout(job_timeout, child.wait_with_output()).await {
                Ok(Ok(output)) if output.status.success() => {
                    JobReport::new(RunnerJobState::Succeeded)
                }
                Ok(Ok(output)) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    let last_line = stderr.trim().lines().last().unwrap_or_default();
                    JobReport::new(RunnerJobState::Failed).with_detail(format!(
                        "exit code {}: {}",
                        output.status.code().unwrap_or(-1),
                        last_line
                    ))
                }
                Ok(Err(e)) => JobReport::new(RunnerJobState::Failed)
                    .with_detail(format!("Failed to wait for job process: {}", e)),
                Err(_) => {
                    warn!(job_id = %watched_id, ?job_timeout, "Job process timed out, killed");
                    JobReport::new(RunnerJobState::Failed)
                        .with_detail(format!("timed out after {:?}", job_timeout))
                }
            };
            Self::set_report(&jobs, &watched_id, report);
        });

        Ok(job_id)
    }

    async fn job_status(&self, job_id: &str) -> Result<JobReport, RunnerError> {
        let table = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(table
            .get(job_id)
            .cloned()
            .unwrap_or_else(|| JobReport::new(RunnerJobState::NotFound)))
    }
}
