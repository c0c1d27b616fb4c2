//! Gating conditions evaluated on every reconciliation pass.
//!
//! Conditions are pure predicates over the request and the job reference
//! already recorded for its current phase (if any). They never perform I/O;
//! the reconciler hands them state it has already loaded.

use std::sync::Arc;

use crate::domain::{GenerationRequest, Phase, PipelineJobRef, RequestStatus};

/// A pure predicate gating whether orchestration may proceed
pub trait Condition: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// `observed` is `None` when no job exists yet for the current phase
    fn is_met(&self, request: &GenerationRequest, observed: Option<&PipelineJobRef>) -> bool;
}

/// Any orchestration at all: the request is not in a terminal status
#[derive(Debug, Clone, Copy, Default)]
pub struct NewRequestCondition;

impl Condition for NewRequestCondition {
    fn name(&self) -> &'static str {
        "new-request"
    }

    fn is_met(&self, request: &GenerationRequest, _observed: Option<&PipelineJobRef>) -> bool {
        !request.status.is_terminal()
    }
}

/// Generation may begin: initialization has completed
#[derive(Debug, Clone, Copy, Default)]
pub struct InitFinishedCondition;

impl Condition for InitFinishedCondition {
    fn name(&self) -> &'static str {
        "init-finished"
    }

    fn is_met(&self, request: &GenerationRequest, _observed: Option<&PipelineJobRef>) -> bool {
        request.status == RequestStatus::Initialized
    }
}

/// One lifecycle phase and the conditions gating its start
#[derive(Clone)]
pub struct Stage {
    pub phase: Phase,
    conditions: Vec<Arc<dyn Condition>>,
}

impl Stage {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            conditions: Vec::new(),
        }
    }

    pub fn gated_by(mut self, condition: impl Condition + 'static) -> Self {
        self.conditions.push(Arc::new(condition));
        self
    }

    /// Name of the first unmet condition, `None` when all are met
    pub fn first_unmet(
        &self,
        request: &GenerationRequest,
        observed: Option<&PipelineJobRef>,
    ) -> Option<&'static str> {
        self.conditions
            .iter()
            .find(|c| !c.is_met(request, observed))
            .map(|c| c.name())
    }
}

/// Ordered stages; a stage inherits the gates of every stage before it
#[derive(Clone)]
pub struct Workflow {
    stages: Vec<Stage>,
}

/// Outcome of evaluating the workflow gates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// The phase may be acted upon
    Open(Phase),

    /// A condition is unmet; nothing to do on this pass
    Closed { condition: &'static str },
}

impl Default for Workflow {
    /// init: [new-request], generate: [new-request, init-finished]
    fn default() -> Self {
        Self::new(vec![
            Stage::new(Phase::Init).gated_by(NewRequestCondition),
            Stage::new(Phase::Generate).gated_by(InitFinishedCondition),
        ])
    }
}

impl Workflow {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Evaluate the gates for the request's current phase.
    ///
    /// Starting a phase (request in its entry status) requires the
    /// conditions of that stage and all earlier stages. Observing a phase
    /// that already has a job only requires the first stage's conditions,
    /// since the later gates describe the entry status, which the request
    /// has left by then.
    pub fn evaluate(&self, request: &GenerationRequest, observed: Option<&PipelineJobRef>) -> Gate {
        let Some(first) = self.stages.first() else {
            return Gate::Closed { condition: "empty-workflow" };
        };
        if let Some(condition) = first.first_unmet(request, observed) {
            return Gate::Closed { condition };
        }

        let Some(phase) = request.status.phase() else {
            return Gate::Closed { condition: "terminal-status" };
        };
        let Some(position) = self.stages.iter().position(|s| s.phase == phase) else {
            return Gate::Closed { condition: "unknown-phase" };
        };

        if request.status == phase.entry_status() {
            for stage in &self.stages[1..=position] {
                if let Some(condition) = stage.first_unmet(request, observed) {
                    return Gate::Closed { condition };
                }
            }
        }

        Gate::Open(phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn request(status: RequestStatus) -> GenerationRequest {
        GenerationRequest::new("build-1", BTreeMap::new()).with_status(status)
    }

    #[test]
    fn test_new_request_condition_is_pure() {
        let job = PipelineJobRef::new(uuid::Uuid::new_v4(), Phase::Init, 0, "job-1");

        for status in RequestStatus::ALL {
            for observed in [None, Some(&job)] {
                assert_eq!(
                    NewRequestCondition.is_met(&request(status), observed),
                    !status.is_terminal(),
                    "status {:?}, job present {}",
                    status,
                    observed.is_some()
                );
            }
        }
    }

    #[test]
    fn test_init_finished_condition() {
        for status in RequestStatus::ALL {
            let met = InitFinishedCondition.is_met(&request(status), None);
            assert_eq!(met, status == RequestStatus::Initialized);
        }
    }

    #[test]
    fn test_workflow_gates() {
        let workflow = Workflow::default();
        let job = PipelineJobRef::new(uuid::Uuid::new_v4(), Phase::Init, 0, "job-1");

        assert_eq!(workflow.evaluate(&request(RequestStatus::New), None), Gate::Open(Phase::Init));
        assert_eq!(
            workflow.evaluate(&request(RequestStatus::Initializing), Some(&job)),
            Gate::Open(Phase::Init)
        );
        assert_eq!(
            workflow.evaluate(&request(RequestStatus::Initialized), None),
            Gate::Open(Phase::Generate)
        );
        assert_eq!(
            workflow.evaluate(&request(RequestStatus::Generating), Some(&job)),
            Gate::Open(Phase::Generate)
        );
        assert_eq!(
            workflow.evaluate(&request(RequestStatus::Finished), None),
            Gate::Closed { condition: "new-request" }
        );
        assert_eq!(
            workflow.evaluate(&request(RequestStatus::Failed), Some(&job)),
            Gate::Closed { condition: "new-request" }
        );
    }

    struct Never;

    impl Condition for Never {
        fn name(&self) -> &'static str {
            "never"
        }

        fn is_met(&self, _: &GenerationRequest, _: Option<&PipelineJobRef>) -> bool {
            false
        }
    }

    #[test]
    fn test_later_stage_requires_earlier_gates() {
        let workflow = Workflow::new(vec![
            Stage::new(Phase::Init).gated_by(NewRequestCondition),
            Stage::new(Phase::Generate)
                .gated_by(InitFinishedCondition)
                .gated_by(Never),
        ]);

        assert_eq!(
            workflow.evaluate(&request(RequestStatus::Initialized), None),
            Gate::Closed { condition: "never" }
        );
        // Init is unaffected by the generate gates
        assert_eq!(workflow.evaluate(&request(RequestStatus::New), None), Gate::Open(Phase::Init));
    }
}
