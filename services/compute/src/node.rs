//! Compute node: bids on shards, runs accepted ones and reports back.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bidmesh_bidstrategy::{BidStrategy, BidStrategyRequest, BidStrategyResponse};
use bidmesh_id::{JobId, NodeId};
use bidmesh_model::{
    JobShard, ResourceUsage, RunResult, ShardReport, ShardReportKind, StorageSource, StorageSpec,
};
use bidmesh_storage::{ContentStore, StorageError};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::capacity::CapacityTracker;
use crate::executor::ShardExecutor;

/// Volume name under which a shard's published results are reported.
pub const RESULTS_VOLUME: &str = "results";

/// Delivers shard reports to whoever scheduled the shard.
#[async_trait]
pub trait ShardReporter: Send + Sync {
    async fn report(&self, report: ShardReport);
}

/// Bid, run and publish loop for one node.
pub struct ComputeNode {
    node_id: NodeId,
    executor: Arc<ShardExecutor>,
    strategy: Arc<dyn BidStrategy>,
    capacity: Arc<CapacityTracker>,
    default_job_resources: ResourceUsage,
    publisher: ContentStore,
    reporter: Arc<dyn ShardReporter>,
    running: Mutex<HashMap<(JobId, u32), CancellationToken>>,
}

impl ComputeNode {
    pub fn new(
        node_id: NodeId,
        executor: Arc<ShardExecutor>,
        strategy: Arc<dyn BidStrategy>,
        capacity: Arc<CapacityTracker>,
        default_job_resources: ResourceUsage,
        publisher: ContentStore,
        reporter: Arc<dyn ShardReporter>,
    ) -> Self {
        Self {
            node_id,
            executor,
            strategy,
            capacity,
            default_job_resources,
            publisher,
            reporter,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Number of shards admitted and not yet finished, including those
    /// still being bid on.
    pub fn running_shards(&self) -> usize {
        self.running_map().len()
    }

    /// Registers a shard so that a cancel of its job reaches it from this
    /// point on, even before the bid is decided.
    ///
    /// Dispatchers call this before handing the shard to its own task.
    /// Admitting the same shard twice returns the same token.
    pub fn admit(&self, job_id: JobId, index: u32) -> CancellationToken {
        self.running_map()
            .entry((job_id, index))
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Decides on a shard and, if accepted, runs it.
    ///
    /// Every path ends with exactly one terminal report: `BidRejected`,
    /// `Completed` or `Failed`.
    #[instrument(skip_all, fields(job_id = %shard.job.id(), shard_index = shard.index, node_id = %self.node_id))]
    pub async fn handle_shard(&self, shard: JobShard) {
        let job_id = *shard.job.id();
        let index = shard.index;

        let token = self.admit(job_id, index);
        let kind = self.bid_and_run(&shard, token).await;
        self.running_map().remove(&(job_id, index));

        self.send(job_id, index, kind).await;
    }

    async fn bid_and_run(&self, shard: &JobShard, token: CancellationToken) -> ShardReportKind {
        let job_id = *shard.job.id();
        let index = shard.index;

        let bid = tokio::select! {
            biased;
            _ = token.cancelled() => return cancelled_before_start(),
            bid = self.bid(shard) => bid,
        };
        let usage = match bid {
            Ok(usage) => usage,
            Err(reason) => {
                info!(reason = %reason, "Declined shard");
                return ShardReportKind::BidRejected { reason };
            }
        };

        if !self.capacity.reserve(&usage) {
            let reason = "insufficient capacity for shard".to_string();
            info!(reason = %reason, "Declined shard");
            return ShardReportKind::BidRejected { reason };
        }
        if token.is_cancelled() {
            self.capacity.release(&usage);
            return cancelled_before_start();
        }

        self.send(job_id, index, ShardReportKind::Started).await;
        let result = self.executor.run_shard(shard, token).await;
        self.capacity.release(&usage);

        self.finish(&job_id, index, result).await
    }

    /// Cancels every admitted shard of a job and tears down its containers.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn cancel_job(&self, job_id: &JobId) {
        let cancelled: Vec<u32> = {
            let running = self.running_map();
            running
                .iter()
                .filter(|((id, _), _)| id == job_id)
                .map(|((_, index), token)| {
                    token.cancel();
                    *index
                })
                .collect()
        };

        for index in cancelled {
            if let Err(e) = self.executor.cancel_shard(job_id, index).await {
                warn!(shard_index = index, error = %e, "Failed to tear down shard");
            }
        }
    }

    /// Runs the bid strategy. Anything other than a firm bid is a decline;
    /// the node never holds a shard waiting.
    async fn bid(&self, shard: &JobShard) -> Result<ResourceUsage, String> {
        let request = BidStrategyRequest::new(self.node_id, shard.job.clone());

        let response = self
            .strategy
            .should_bid(&request)
            .await
            .map_err(|e| format!("bid strategy failed: {e}"))?;
        decline_unless_bid(&response)?;

        let usage = ResourceUsage::parse(&shard.job.spec.resources)
            .map_err(|e| e.to_string())?
            .or_defaults(&self.default_job_resources);
        let response = self
            .strategy
            .should_bid_based_on_usage(&request, &usage)
            .await
            .map_err(|e| format!("bid strategy failed: {e}"))?;
        decline_unless_bid(&response)?;

        Ok(usage)
    }

    async fn finish(&self, job_id: &JobId, index: u32, result: RunResult) -> ShardReportKind {
        if !result.is_success() {
            let error = result.error.clone().unwrap_or_else(|| {
                format!("exited with code {}", result.exit_code.unwrap_or(-1))
            });
            warn!(error = %error, "Shard failed");
            return ShardReportKind::Failed {
                run_result: Some(result),
                error,
            };
        }

        let results = self.executor.shard_results_dir(job_id, index);
        match self.publish(&results).await {
            Ok(published) => {
                info!(cid = ?published.source, "Shard completed");
                ShardReportKind::Completed {
                    run_result: result,
                    published: Some(published),
                }
            }
            Err(e) => ShardReportKind::Failed {
                error: format!("failed to publish results: {e}"),
                run_result: Some(result),
            },
        }
    }

    async fn publish(&self, results: &Path) -> Result<StorageSpec, StorageError> {
        let cid = self.publisher.put_dir(results).await?;
        Ok(StorageSpec {
            name: RESULTS_VOLUME.to_string(),
            path: results.display().to_string(),
            source: StorageSource::Content { cid },
        })
    }

    async fn send(&self, job_id: JobId, shard_index: u32, kind: ShardReportKind) {
        self.reporter
            .report(ShardReport {
                job_id,
                node_id: self.node_id,
                shard_index,
                kind,
            })
            .await;
    }

    fn running_map(&self) -> std::sync::MutexGuard<'_, HashMap<(JobId, u32), CancellationToken>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn cancelled_before_start() -> ShardReportKind {
    info!("Shard cancelled before it started");
    ShardReportKind::Failed {
        run_result: None,
        error: "shard cancelled before it started".to_string(),
    }
}

fn decline_unless_bid(response: &BidStrategyResponse) -> Result<(), String> {
    if response.should_bid() {
        return Ok(());
    }
    if response.should_wait() {
        return Err(format!("node deferred its bid: {}", response.reason()));
    }
    Err(response.reason().to_string())
}
