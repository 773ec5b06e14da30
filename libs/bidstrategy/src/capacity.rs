//! Resource capacity strategy.

use std::sync::Arc;

use async_trait::async_trait;
use bidmesh_model::ResourceUsage;

use crate::error::BidStrategyError;
use crate::types::{BidStrategy, BidStrategyRequest, BidStrategyResponse};

/// Live view of a node's unreserved resources.
pub trait CapacitySource: Send + Sync {
    fn available(&self) -> ResourceUsage;
}

/// Rejects jobs whose request exceeds the per-job limit or what the node
/// has left.
pub struct ResourceCapacityStrategy {
    job_limit: ResourceUsage,
    capacity: Arc<dyn CapacitySource>,
}

impl ResourceCapacityStrategy {
    pub fn new(job_limit: ResourceUsage, capacity: Arc<dyn CapacitySource>) -> Self {
        Self {
            job_limit,
            capacity,
        }
    }
}

#[async_trait]
impl BidStrategy for ResourceCapacityStrategy {
    async fn should_bid(
        &self,
        request: &BidStrategyRequest,
    ) -> Result<BidStrategyResponse, BidStrategyError> {
        let usage = ResourceUsage::parse(&request.job.spec.resources)?;
        self.should_bid_based_on_usage(request, &usage).await
    }

    async fn should_bid_based_on_usage(
        &self,
        _request: &BidStrategyRequest,
        usage: &ResourceUsage,
    ) -> Result<BidStrategyResponse, BidStrategyError> {
        if !usage.fits_within(&self.job_limit) {
            return Ok(BidStrategyResponse::reject(format!(
                "job resource request {usage:?} exceeds per-job limit {:?}",
                self.job_limit
            )));
        }
        let available = self.capacity.available();
        if !usage.fits_within(&available) {
            return Ok(BidStrategyResponse::reject(format!(
                "job resource request {usage:?} exceeds available capacity {available:?}"
            )));
        }
        Ok(BidStrategyResponse::bid())
    }
}

impl std::fmt::Debug for ResourceCapacityStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCapacityStrategy")
            .field("job_limit", &self.job_limit)
            .finish_non_exhaustive()
    }
}
