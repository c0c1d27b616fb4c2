//! Lifecycle state model.
//!
//! `next_status` is a deterministic function of the current status and the
//! orchestrator's observation of the current phase. It performs no I/O, so
//! every transition can be tested in isolation.

use thiserror::Error;

use crate::domain::{JobState, Phase, PipelineJobRef, RequestStatus};

/// What the orchestrator saw for the current phase
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// The phase's job was created on this pass
    Started { job: PipelineJobRef },

    /// The phase's job already existed and reports `state`
    Observed {
        job: PipelineJobRef,
        state: JobState,
        detail: Option<String>,
    },

    /// The job runner refused to create the job
    CreateFailed { reason: String },

    /// Timeout, transport error or other lag; look again later
    Inconclusive { reason: String },
}

impl Observation {
    fn job(&self) -> Option<&PipelineJobRef> {
        match self {
            Self::Started { job } | Self::Observed { job, .. } => Some(job),
            Self::CreateFailed { .. } | Self::Inconclusive { .. } => None,
        }
    }
}

/// A decided status change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: RequestStatus,
    pub to: RequestStatus,

    /// Human-readable cause, copied into the request and its event
    pub reason: String,
}

/// Contract violations detected by the state model
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("Observed a '{observed}' job while the request is in phase '{expected}'")]
    PhaseMismatch { expected: Phase, observed: Phase },

    #[error("Illegal transition {from} -> {to}")]
    IllegalTransition {
        from: RequestStatus,
        to: RequestStatus,
    },
}

/// Decide the next status, `None` meaning "no transition, re-check later"
pub fn next_status(
    current: RequestStatus,
    observation: &Observation,
) -> Result<Option<Transition>, StateError> {
    let Some(phase) = current.phase() else {
        return Ok(None);
    };

    if let Some(job) = observation.job() {
        if job.phase != phase {
            return Err(StateError::PhaseMismatch {
                expected: phase,
                observed: job.phase,
            });
        }
    }

    let entering = current == phase.entry_status();
    let to = |to: RequestStatus, reason: String| Transition {
        from: current,
        to,
        reason,
    };

    let transition = match observation {
        Observation::Inconclusive { .. } => None,

        Observation::CreateFailed { reason } => Some(to(
            RequestStatus::Failed,
            format!("Failed to create {} job: {}", phase, reason),
        )),

        Observation::Started { job } => entering.then(|| {
            to(
                phase.running_status(),
                format!("Started {} job {}", phase, job.job_id),
            )
        }),

        Observation::Observed { job, state, detail } => match state {
            JobState::NotStarted | JobState::Running => entering.then(|| {
                to(
                    phase.running_status(),
                    format!("Adopted running {} job {}", phase, job.job_id),
                )
            }),
            // One step per pass: an entry status first moves to running
            JobState::Succeeded if entering => Some(to(
                phase.running_status(),
                format!("Adopted finished {} job {}", phase, job.job_id),
            )),
            JobState::Succeeded => Some(to(
                phase.completed_status(),
                format!("{} job {} succeeded", capitalize(phase.as_str()), job.job_id),
            )),
            JobState::Failed => Some(to(
                RequestStatus::Failed,
                detail
                    .clone()
                    .unwrap_or_else(|| format!("{} job {} failed", phase, job.job_id)),
            )),
        },
    };

    match transition {
        Some(t) if !t.from.can_transition_to(t.to) => Err(StateError::IllegalTransition {
            from: t.from,
            to: t.to,
        }),
        other => Ok(other),
    }
}

/// Operator retry: only a failed request may be reset to `New`
pub fn retry(current: RequestStatus) -> Result<Transition, StateError> {
    if current != RequestStatus::Failed {
        return Err(StateError::IllegalTransition {
            from: current,
            to: RequestStatus::New,
        });
    }

    Ok(Transition {
        from: current,
        to: RequestStatus::New,
        reason: "Retry requested".to_string(),
    })
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn job(phase: Phase) -> PipelineJobRef {
        PipelineJobRef::new(Uuid::new_v4(), phase, 0, format!("sbom-{}-abc-0", phase))
    }

    fn observed(phase: Phase, state: JobState) -> Observation {
        Observation::Observed {
            job: job(phase),
            state,
            detail: None,
        }
    }

    fn target(current: RequestStatus, observation: &Observation) -> Option<RequestStatus> {
        next_status(current, observation).unwrap().map(|t| t.to)
    }

    #[test]
    fn test_started_job_enters_running_status() {
        let started = Observation::Started { job: job(Phase::Init) };
        assert_eq!(target(RequestStatus::New, &started), Some(RequestStatus::Initializing));

        let started = Observation::Started { job: job(Phase::Generate) };
        assert_eq!(
            target(RequestStatus::Initialized, &started),
            Some(RequestStatus::Generating)
        );
    }

    #[test]
    fn test_success_completes_phase() {
        assert_eq!(
            target(RequestStatus::Initializing, &observed(Phase::Init, JobState::Succeeded)),
            Some(RequestStatus::Initialized)
        );
        assert_eq!(
            target(RequestStatus::Generating, &observed(Phase::Generate, JobState::Succeeded)),
            Some(RequestStatus::Finished)
        );
    }

    #[test]
    fn test_success_never_skips_running_status() {
        assert_eq!(
            target(RequestStatus::New, &observed(Phase::Init, JobState::Succeeded)),
            Some(RequestStatus::Initializing)
        );
    }

    #[test]
    fn test_running_job_is_no_change() {
        for state in [JobState::NotStarted, JobState::Running] {
            assert_eq!(target(RequestStatus::Initializing, &observed(Phase::Init, state)), None);
            assert_eq!(target(RequestStatus::Generating, &observed(Phase::Generate, state)), None);
        }
    }

    #[test]
    fn test_failure_carries_detail() {
        let observation = Observation::Observed {
            job: job(Phase::Generate),
            state: JobState::Failed,
            detail: Some("exit code 1: no manifest".to_string()),
        };

        let transition = next_status(RequestStatus::Generating, &observation)
            .unwrap()
            .unwrap();
        assert_eq!(transition.to, RequestStatus::Failed);
        assert_eq!(transition.reason, "exit code 1: no manifest");
    }

    #[test]
    fn test_create_failure_fails_request() {
        let observation = Observation::CreateFailed {
            reason: "unknown build".to_string(),
        };
        let transition = next_status(RequestStatus::New, &observation).unwrap().unwrap();
        assert_eq!(transition.to, RequestStatus::Failed);
        assert!(transition.reason.contains("unknown build"));
    }

    #[test]
    fn test_inconclusive_is_no_change() {
        let observation = Observation::Inconclusive {
            reason: "timeout".to_string(),
        };
        for status in RequestStatus::ALL {
            assert_eq!(next_status(status, &observation), Ok(None));
        }
    }

    #[test]
    fn test_terminal_statuses_never_move() {
        for status in [RequestStatus::Finished, RequestStatus::Failed] {
            assert_eq!(
                next_status(status, &observed(Phase::Generate, JobState::Failed)),
                Ok(None)
            );
        }
    }

    #[test]
    fn test_phase_mismatch_is_contract_error() {
        let err = next_status(
            RequestStatus::Generating,
            &observed(Phase::Init, JobState::Succeeded),
        )
        .unwrap_err();
        assert_eq!(
            err,
            StateError::PhaseMismatch {
                expected: Phase::Generate,
                observed: Phase::Init
            }
        );
    }

    #[test]
    fn test_transitions_are_monotonic() {
        let observations = [
            Observation::Started { job: job(Phase::Init) },
            observed(Phase::Init, JobState::Running),
            observed(Phase::Init, JobState::Succeeded),
            observed(Phase::Init, JobState::Failed),
            Observation::CreateFailed { reason: "x".into() },
        ];

        for status in [RequestStatus::New, RequestStatus::Initializing] {
            for observation in &observations {
                if let Some(t) = next_status(status, observation).unwrap() {
                    assert!(t.to.rank() > status.rank(), "{:?} -> {:?}", status, t.to);
                }
            }
        }
    }

    #[test]
    fn test_retry_only_from_failed() {
        assert_eq!(retry(RequestStatus::Failed).unwrap().to, RequestStatus::New);
        for status in RequestStatus::ALL {
            if status != RequestStatus::Failed {
                assert!(retry(status).is_err());
            }
        }
    }
}
