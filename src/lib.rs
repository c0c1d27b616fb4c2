//! sbomer - SBOM generation request reconciler
//!
//! Drives SBOM generation requests through their lifecycle by
//! reconciling each request against the external pipeline jobs that
//! perform its phases.
//!
//! # Architecture
//!
//! The system is a level-triggered control loop:
//! - Pure conditions gate whether a phase may be acted upon
//! - A pure state model maps (status, job observation) to the next status
//! - Status changes are committed with compare-and-swap on a revision
//! - Events are published after the commit, at-least-once
//!
//! # Modules
//!
//! - `adapters`: Job runners (memory, process, HTTP) and the webhook channel
//! - `core`: Conditions, state model, orchestrator, reconciler, controller, stores
//! - `domain`: Data structures (GenerationRequest, PipelineJobRef, EventRecord)
//! - `notify`: Event publisher, channels and worker dispatch
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Submit a request
//! sbomer submit build-1234 --meta worker=index
//!
//! # Check its status
//! sbomer status <request-id>
//!
//! # Run the controller
//! sbomer run
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod notify;

// Re-export main types at crate root for convenience
pub use core::{Controller, PipelineOrchestrator, ReconcileOutcome, Reconciler, Workflow};
pub use domain::{EventRecord, GenerationRecord, GenerationRequest, Phase, PipelineJobRef, RequestStatus};
pub use notify::{EventPublisher, Worker, WorkerDispatcher};
