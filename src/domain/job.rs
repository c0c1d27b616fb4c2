//! References from requests to the external pipeline jobs running their phases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::request::Phase;

/// Weak reference: request id -> external job id for one phase attempt.
///
/// Carries no authoritative job state; the job runner owns that.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineJobRef {
    pub request_id: Uuid,
    pub phase: Phase,

    /// Request attempt the job was created for
    pub attempt: u32,

    /// Stable identifier assigned by the job runner
    pub job_id: String,

    /// When the job was created (start of the visibility grace period)
    pub created_at: DateTime<Utc>,
}

impl PipelineJobRef {
    pub fn new(request_id: Uuid, phase: Phase, attempt: u32, job_id: impl Into<String>) -> Self {
        Self {
            request_id,
            phase,
            attempt,
            job_id: job_id.into(),
            created_at: Utc::now(),
        }
    }
}

/// Interpreted state of an external job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    NotStarted,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Deterministic job name for a phase attempt.
///
/// Format: `sbom-{phase}-{hash16}-{attempt}` where the hash is the first
/// 8 bytes of sha256(request_id). Re-creating the same attempt therefore
/// collides in the job runner instead of spawning a duplicate.
pub fn job_name(request_id: Uuid, phase: Phase, attempt: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request_id.as_bytes());
    let digest = hasher.finalize();
    format!("sbom-{}-{}-{}", phase, hex::encode(&digest[..8]), attempt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_name_is_deterministic() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();

        let a = job_name(id, Phase::Init, 0);
        let b = job_name(id, Phase::Init, 0);
        assert_eq!(a, b);
        assert!(a.starts_with("sbom-init-"));
        assert!(a.ends_with("-0"));

        // sbom-init-<16 hex>-0
        let hash = a.trim_start_matches("sbom-init-").trim_end_matches("-0");
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_job_name_varies_by_phase_and_attempt() {
        let id = Uuid::new_v4();
        assert_ne!(job_name(id, Phase::Init, 0), job_name(id, Phase::Generate, 0));
        assert_ne!(job_name(id, Phase::Init, 0), job_name(id, Phase::Init, 1));
    }
}
