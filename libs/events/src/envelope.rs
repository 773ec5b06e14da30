//! Event envelope - the common wrapper for all events.

use bidmesh_id::{EventId, JobId, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EventError;

/// Current envelope schema version.
pub const EVENT_API_VERSION: &str = "v1";

/// Actor type for audit logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// A client acting through the requester endpoint.
    User,
    /// The system itself (bid decisions, housekeeping, compute reports).
    #[default]
    System,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::System => write!(f, "system"),
        }
    }
}

/// The event envelope - common metadata for all events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<P> {
    pub api_version: String,

    /// Time-ordered event identifier.
    pub event_id: EventId,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// The job this event belongs to.
    pub job_id: JobId,

    /// Node that emitted the event.
    pub source_node_id: NodeId,

    /// The event type (e.g., "job.created", "shard.state_changed").
    pub event_type: String,

    /// Type of actor that triggered the event.
    pub actor_type: ActorType,

    /// Event-specific payload.
    pub payload: P,
}

impl<P> EventEnvelope<P> {
    /// Creates a new event envelope builder.
    pub fn builder() -> EventEnvelopeBuilder<P> {
        EventEnvelopeBuilder::new()
    }
}

/// Builder for constructing event envelopes.
#[derive(Debug)]
pub struct EventEnvelopeBuilder<P> {
    event_id: Option<EventId>,
    occurred_at: Option<DateTime<Utc>>,
    job_id: Option<JobId>,
    source_node_id: Option<NodeId>,
    event_type: Option<String>,
    actor_type: ActorType,
    payload: Option<P>,
}

impl<P> EventEnvelopeBuilder<P> {
    pub fn new() -> Self {
        Self {
            event_id: None,
            occurred_at: None,
            job_id: None,
            source_node_id: None,
            event_type: None,
            actor_type: ActorType::System,
            payload: None,
        }
    }

    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    pub fn occurred_at(mut self, ts: DateTime<Utc>) -> Self {
        self.occurred_at = Some(ts);
        self
    }

    pub fn job_id(mut self, id: JobId) -> Self {
        self.job_id = Some(id);
        self
    }

    pub fn source_node(mut self, id: NodeId) -> Self {
        self.source_node_id = Some(id);
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn actor(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }

    pub fn payload(mut self, payload: P) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Builds the event envelope.
    ///
    /// `event_id` and `occurred_at` default to fresh values.
    pub fn build(self) -> Result<EventEnvelope<P>, EventError> {
        Ok(EventEnvelope {
            api_version: EVENT_API_VERSION.to_string(),
            event_id: self.event_id.unwrap_or_default(),
            occurred_at: self.occurred_at.unwrap_or_else(Utc::now),
            job_id: self.job_id.ok_or(EventError::MissingField("job_id"))?,
            source_node_id: self
                .source_node_id
                .ok_or(EventError::MissingField("source_node_id"))?,
            event_type: self
                .event_type
                .ok_or(EventError::MissingField("event_type"))?,
            actor_type: self.actor_type,
            payload: self.payload.ok_or(EventError::MissingField("payload"))?,
        })
    }
}

impl<P> Default for EventEnvelopeBuilder<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_type_serialization() {
        assert_eq!(serde_json::to_string(&ActorType::User).unwrap(), "\"user\"");
        assert_eq!(
            serde_json::to_string(&ActorType::System).unwrap(),
            "\"system\""
        );
    }

    #[test]
    fn test_event_envelope_builder() {
        let job_id = JobId::new();
        let envelope = EventEnvelope::<serde_json::Value>::builder()
            .job_id(job_id)
            .source_node(NodeId::new())
            .event_type("job.created")
            .actor(ActorType::User)
            .payload(serde_json::json!({"client_id": "cli"}))
            .build()
            .unwrap();

        assert_eq!(envelope.event_type, "job.created");
        assert_eq!(envelope.api_version, EVENT_API_VERSION);
        assert_eq!(envelope.job_id, job_id);
        assert_eq!(envelope.actor_type, ActorType::User);
    }

    #[test]
    fn test_builder_reports_missing_field() {
        let err = EventEnvelope::<()>::builder()
            .job_id(JobId::new())
            .event_type("job.created")
            .payload(())
            .build()
            .unwrap_err();
        assert!(matches!(err, EventError::MissingField("source_node_id")));
    }
}
