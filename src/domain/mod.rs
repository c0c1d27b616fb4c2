//! Domain types for the SBOM generation reconciler.
//!
//! This module contains the core data structures:
//! - GenerationRequest: the unit of work and its lifecycle status
//! - PipelineJobRef: weak link from a request phase to an external job
//! - GenerationRecord: summary of one job execution
//! - EventRecord: immutable notification of a status transition

pub mod events;
pub mod generation;
pub mod job;
pub mod request;

// Re-export commonly used types
pub use events::EventRecord;
pub use generation::GenerationRecord;
pub use job::{job_name, JobState, PipelineJobRef};
pub use request::{GenerationRequest, Phase, RequestStatus, WORKER_METADATA_KEY};
