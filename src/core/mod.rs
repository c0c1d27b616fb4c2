//! Core reconciliation logic.
//!
//! This module contains:
//! - Conditions: pure gates evaluated on every pass
//! - State: the pure lifecycle transition function
//! - Orchestrator: one external job per phase
//! - Reconciler: the level-triggered control loop
//! - Controller: work queue and worker pool
//! - Store: persistence of requests, jobs, generations and events

pub mod conditions;
pub mod controller;
pub mod file_store;
pub mod orchestrator;
pub mod reconciler;
pub mod retry;
pub mod state;
pub mod store;

// Re-export commonly used types
pub use conditions::{Condition, Gate, InitFinishedCondition, NewRequestCondition, Stage, Workflow};
pub use controller::{Controller, ControllerSettings, WorkQueue};
pub use file_store::FileStore;
pub use orchestrator::{OrchestratorSettings, PhaseReport, PipelineOrchestrator};
pub use reconciler::{ReconcileError, ReconcileOutcome, Reconciler};
pub use retry::RetryPolicy;
pub use state::{next_status, Observation, StateError, Transition};
pub use store::{Commit, MemoryStore, RequestStore, StoreError};
