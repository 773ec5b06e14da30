//! Event sinks.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::EventError;
use crate::types::JobEvent;

/// Destination for lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: JobEvent) -> Result<(), EventError>;
}

/// Fans events out to every subscriber over a broadcast channel.
///
/// Publishing with no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: broadcast::Sender<JobEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

impl Default for ChannelSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn publish(&self, event: JobEvent) -> Result<(), EventError> {
        tracing::debug!(
            job_id = %event.job_id,
            event_type = %event.event_type,
            "publishing event"
        );
        if self.tx.send(event).is_err() {
            tracing::trace!("no event subscribers");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventEnvelope;
    use crate::types::{JobCreatedPayload, JobEventPayload};
    use bidmesh_id::{JobId, NodeId};

    fn event() -> JobEvent {
        let payload = JobEventPayload::JobCreated(JobCreatedPayload {
            client_id: "cli".into(),
            shard_count: 1,
        });
        EventEnvelope::builder()
            .job_id(JobId::new())
            .source_node(NodeId::new())
            .event_type(payload.event_type())
            .payload(payload)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let sink = ChannelSink::new(8);
        let mut rx = sink.subscribe();
        let ev = event();
        sink.publish(ev.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), ev);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let sink = ChannelSink::default();
        assert!(sink.publish(event()).await.is_ok());
    }
}
