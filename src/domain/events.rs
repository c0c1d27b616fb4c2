//! Event records announcing request status transitions.
//!
//! Events are immutable once built. Each event links to the previous event
//! of the same request through `parent`, so consumers can restore causal
//! order even when delivery across requests interleaves.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::generation::GenerationRecord;
use super::request::{GenerationRequest, RequestStatus, WORKER_METADATA_KEY};

/// A single notification about an observable status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Unique identifier for this event
    pub id: Uuid,

    /// Previous event of the same request, if any
    pub parent: Option<Uuid>,

    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,

    /// Copied from the request, extended with correlation ids
    pub metadata: BTreeMap<String, String>,

    /// Snapshot of the request after the transition
    pub request: GenerationRequest,

    /// Executions recorded for the request so far, oldest first
    pub generations: Vec<GenerationRecord>,

    /// Status the request transitioned to
    pub status: RequestStatus,

    /// Human-readable cause (NO secrets)
    pub reason: String,
}

impl EventRecord {
    /// Build the event for a request that has just been persisted
    pub fn for_transition(
        request: &GenerationRequest,
        parent: Option<Uuid>,
        generations: Vec<GenerationRecord>,
        reason: impl Into<String>,
    ) -> Self {
        let now = Utc::now();

        let mut metadata = request.metadata.clone();
        metadata.insert("request_id".to_string(), request.id.to_string());
        metadata.insert("build_id".to_string(), request.build_id.clone());

        Self {
            id: Uuid::new_v4(),
            parent,
            created: now,
            updated: now,
            finished: Some(now),
            metadata,
            request: request.clone(),
            generations,
            status: request.status,
            reason: reason.into(),
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request.id
    }

    /// Whether the event is routed to workers with the given interest key.
    ///
    /// Pure: only inspects the metadata map.
    pub fn is_routed_to(&self, interest_key: &str) -> bool {
        self.metadata
            .get(WORKER_METADATA_KEY)
            .map(|keys| keys.split(',').any(|k| k.trim() == interest_key))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> GenerationRequest {
        GenerationRequest::new("build-42", BTreeMap::new())
            .with_metadata(WORKER_METADATA_KEY, "index, audit")
    }

    #[test]
    fn test_event_copies_request_metadata() {
        let request = request();
        let event = EventRecord::for_transition(&request, None, Vec::new(), "Request created");

        assert_eq!(event.status, RequestStatus::New);
        assert_eq!(event.metadata.get("build_id").map(String::as_str), Some("build-42"));
        assert_eq!(
            event.metadata.get("request_id"),
            Some(&request.id.to_string())
        );
        assert!(event.finished.is_some());
    }

    #[test]
    fn test_routing_by_interest_key() {
        let event = EventRecord::for_transition(&request(), None, Vec::new(), "created");

        assert!(event.is_routed_to("index"));
        assert!(event.is_routed_to("audit"));
        assert!(!event.is_routed_to("umb"));
    }

    #[test]
    fn test_event_serialization() {
        let parent = Uuid::new_v4();
        let event = EventRecord::for_transition(&request(), Some(parent), Vec::new(), "created");

        let json = serde_json::to_string(&event).unwrap();
        let parsed: EventRecord = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.parent, Some(parent));
        assert_eq!(parsed, event);
    }
}
