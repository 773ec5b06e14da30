//! Handing shards to compute nodes.

use async_trait::async_trait;
use bidmesh_id::JobId;
use bidmesh_model::Job;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct DispatchError(pub String);

/// Transport to compute nodes.
///
/// Implementations must not call back into the scheduling queue before
/// returning; shard progress flows back through
/// [`SchedulingQueue::report_shard`](crate::SchedulingQueue::report_shard).
#[async_trait]
pub trait ShardDispatcher: Send + Sync {
    /// Offers every shard of a job that has just started running.
    async fn dispatch(&self, job: &Job) -> Result<(), DispatchError>;

    /// Tells compute nodes to stop a job's in-flight shards.
    async fn cancel(&self, job_id: &JobId, reason: &str) -> Result<(), DispatchError>;
}
