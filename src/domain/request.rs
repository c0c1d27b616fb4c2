//! Generation requests and their lifecycle status.
//!
//! A request is the unit under reconciliation. Its status only moves
//! forward through the lifecycle, except for an operator retry which
//! resets a failed request to `New`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata key carrying the interest keys of workers that should react
/// to events of this request (comma-separated).
pub const WORKER_METADATA_KEY: &str = "worker";

/// Lifecycle status of a generation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    /// Accepted, nothing started yet
    New,

    /// Initialization job created and running
    Initializing,

    /// Initialization job succeeded
    Initialized,

    /// Generation job created and running
    Generating,

    /// Generation job succeeded
    Finished,

    /// A phase failed (can be retried by an operator)
    Failed,
}

impl RequestStatus {
    /// All statuses in lifecycle order
    pub const ALL: [RequestStatus; 6] = [
        RequestStatus::New,
        RequestStatus::Initializing,
        RequestStatus::Initialized,
        RequestStatus::Generating,
        RequestStatus::Finished,
        RequestStatus::Failed,
    ];

    /// Terminal statuses are immutable until an explicit retry
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }

    /// Position in the lifecycle order. `Failed` ranks last since it can be
    /// entered from any non-terminal status.
    pub fn rank(self) -> u8 {
        match self {
            Self::New => 0,
            Self::Initializing => 1,
            Self::Initialized => 2,
            Self::Generating => 3,
            Self::Finished => 4,
            Self::Failed => 5,
        }
    }

    /// Phase this status belongs to, `None` for terminal statuses
    pub fn phase(self) -> Option<Phase> {
        match self {
            Self::New | Self::Initializing => Some(Phase::Init),
            Self::Initialized | Self::Generating => Some(Phase::Generate),
            Self::Finished | Self::Failed => None,
        }
    }

    /// Whether the legal transition table allows `self -> next`
    pub fn can_transition_to(self, next: RequestStatus) -> bool {
        use RequestStatus::*;

        match (self, next) {
            (New, Initializing)
            | (Initializing, Initialized)
            | (Initialized, Generating)
            | (Generating, Finished) => true,
            (from, Failed) => !from.is_terminal(),
            (Failed, New) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::Initializing => "INITIALIZING",
            Self::Initialized => "INITIALIZED",
            Self::Generating => "GENERATING",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// A lifecycle stage backed by one external job execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Prepare the build environment and resolve the artifact
    Init,

    /// Produce the SBOM itself
    Generate,
}

impl Phase {
    /// Status a request enters once the phase's job exists
    pub fn running_status(self) -> RequestStatus {
        match self {
            Self::Init => RequestStatus::Initializing,
            Self::Generate => RequestStatus::Generating,
        }
    }

    /// Status a request enters once the phase's job succeeded
    pub fn completed_status(self) -> RequestStatus {
        match self {
            Self::Init => RequestStatus::Initialized,
            Self::Generate => RequestStatus::Finished,
        }
    }

    /// Status from which the phase's job is started
    pub fn entry_status(self) -> RequestStatus {
        match self {
            Self::Init => RequestStatus::New,
            Self::Generate => RequestStatus::Initialized,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Generate => "generate",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of work under reconciliation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Opaque identifier
    pub id: Uuid,

    /// External build identifier this request produces an SBOM for
    pub build_id: String,

    /// Current lifecycle status
    pub status: RequestStatus,

    /// Human-readable cause of the last transition
    pub reason: Option<String>,

    /// Routing hints and correlation ids
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// Retry counter, bumped by every operator retry
    #[serde(default)]
    pub attempt: u32,

    /// Bumped on every persisted change (compare-and-swap guard)
    #[serde(default)]
    pub revision: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationRequest {
    /// Create a new request in the `New` status
    pub fn new(build_id: impl Into<String>, metadata: BTreeMap<String, String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            build_id: build_id.into(),
            status: RequestStatus::New,
            reason: None,
            metadata,
            attempt: 0,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the status directly (builder style, used by fixtures and tests)
    pub fn with_status(mut self, status: RequestStatus) -> Self {
        self.status = status;
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
