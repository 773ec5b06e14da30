//! Event type definitions for job lifecycle events.
//!
//! Each event type has a corresponding payload struct with the event-specific
//! data. [`JobEventPayload`] unifies them for transport.

use bidmesh_id::NodeId;
use bidmesh_model::{CancelSource, JobStateType, RunResult, ShardStateType, StorageSpec};
use serde::{Deserialize, Serialize};

use crate::envelope::EventEnvelope;

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    // Job
    pub const JOB_CREATED: &str = "job.created";
    pub const JOB_STATE_CHANGED: &str = "job.state_changed";

    // Shard
    pub const SHARD_STATE_CHANGED: &str = "shard.state_changed";
    pub const SHARD_RESULTS_PUBLISHED: &str = "shard.results_published";
}

// =============================================================================
// Job Events
// =============================================================================

/// Payload for job.created event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCreatedPayload {
    pub client_id: String,
    pub shard_count: u32,
}

/// Payload for job.state_changed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStateChangedPayload {
    pub previous: JobStateType,
    pub state: JobStateType,
    pub version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_by: Option<CancelSource>,
}

// =============================================================================
// Shard Events
// =============================================================================

/// Payload for shard.state_changed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardStateChangedPayload {
    pub node_id: NodeId,
    pub shard_index: u32,
    pub state: ShardStateType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_result: Option<RunResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Payload for shard.results_published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardResultsPublishedPayload {
    pub node_id: NodeId,
    pub shard_index: u32,
    pub published_result: StorageSpec,
}

/// Any job lifecycle payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum JobEventPayload {
    JobCreated(JobCreatedPayload),
    JobStateChanged(JobStateChangedPayload),
    ShardStateChanged(ShardStateChangedPayload),
    ShardResultsPublished(ShardResultsPublishedPayload),
}

impl JobEventPayload {
    /// The `event_type` string for this payload.
    pub fn event_type(&self) -> &'static str {
        match self {
            JobEventPayload::JobCreated(_) => event_types::JOB_CREATED,
            JobEventPayload::JobStateChanged(_) => event_types::JOB_STATE_CHANGED,
            JobEventPayload::ShardStateChanged(_) => event_types::SHARD_STATE_CHANGED,
            JobEventPayload::ShardResultsPublished(_) => event_types::SHARD_RESULTS_PUBLISHED,
        }
    }
}

/// A job lifecycle event.
pub type JobEvent = EventEnvelope<JobEventPayload>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_changed_payload() {
        let payload = JobStateChangedPayload {
            previous: JobStateType::Running,
            state: JobStateType::Cancelled,
            version: 4,
            reason: Some("job rejected: busy".into()),
            cancelled_by: Some(CancelSource::System),
        };
        let json = serde_json::to_value(JobEventPayload::JobStateChanged(payload)).unwrap();
        assert_eq!(json["kind"], "job_state_changed");
        assert_eq!(json["data"]["state"], "cancelled");
        assert_eq!(json["data"]["cancelled_by"], "system");
    }

    #[test]
    fn test_payload_event_type() {
        let payload = JobEventPayload::JobCreated(JobCreatedPayload {
            client_id: "cli".into(),
            shard_count: 1,
        });
        assert_eq!(payload.event_type(), event_types::JOB_CREATED);
    }
}
