//! In-process transport between the requester and the compute node.

use std::sync::Arc;

use async_trait::async_trait;
use bidmesh_compute::{ComputeNode, ShardReporter};
use bidmesh_id::JobId;
use bidmesh_model::{Job, ShardReport};
use bidmesh_requester::{DispatchError, SchedulingQueue, ShardDispatcher};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Hands shards to a compute node in the same process.
///
/// Each shard runs on its own task, so dispatch returns before any report
/// reaches the queue. Shards are admitted before their tasks are spawned,
/// so a cancel issued after `dispatch` returns always reaches them.
pub struct LocalDispatcher {
    compute: Arc<ComputeNode>,
}

impl LocalDispatcher {
    pub fn new(compute: Arc<ComputeNode>) -> Self {
        Self { compute }
    }
}

#[async_trait]
impl ShardDispatcher for LocalDispatcher {
    async fn dispatch(&self, job: &Job) -> Result<(), DispatchError> {
        for shard in job.shards() {
            debug!(job_id = %job.id(), shard_index = shard.index, "Dispatching shard");
            self.compute.admit(*job.id(), shard.index);
            let compute = Arc::clone(&self.compute);
            tokio::spawn(async move { compute.handle_shard(shard).await });
        }
        Ok(())
    }

    async fn cancel(&self, job_id: &JobId, reason: &str) -> Result<(), DispatchError> {
        info!(job_id = %job_id, reason = %reason, "Cancelling shards");
        self.compute.cancel_job(job_id).await;
        Ok(())
    }
}

/// Queues shard reports for [`forward_reports`].
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<ShardReport>,
}

impl ChannelReporter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ShardReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ShardReporter for ChannelReporter {
    async fn report(&self, report: ShardReport) {
        if let Err(e) = self.tx.send(report) {
            warn!(job_id = %e.0.job_id, "Dropped shard report, requester is gone");
        }
    }
}

/// Applies shard reports to the queue until shutdown or until every
/// reporter is dropped.
pub async fn forward_reports(
    queue: Arc<SchedulingQueue>,
    mut reports: mpsc::UnboundedReceiver<ShardReport>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            report = reports.recv() => {
                let Some(report) = report else {
                    break;
                };
                let (job_id, shard_index) = (report.job_id, report.shard_index);
                if let Err(e) = queue.report_shard(report).await {
                    warn!(job_id = %job_id, shard_index, error = %e, "Failed to apply shard report");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Report forwarder shutting down");
                    break;
                }
            }
        }
    }
}
