use async_trait::async_trait;
use bidmesh_model::ResourceUsage;

use crate::error::BidStrategyError;
use crate::types::{BidStrategy, BidStrategyRequest, BidStrategyResponse};

/// Always gives the same answer.
#[derive(Debug, Clone)]
pub struct FixedStrategy {
    response: BidStrategyResponse,
}

impl FixedStrategy {
    pub fn new(response: BidStrategyResponse) -> Self {
        Self { response }
    }

    pub fn always_bid() -> Self {
        Self::new(BidStrategyResponse::bid())
    }
}

#[async_trait]
impl BidStrategy for FixedStrategy {
    async fn should_bid(
        &self,
        _request: &BidStrategyRequest,
    ) -> Result<BidStrategyResponse, BidStrategyError> {
        Ok(self.response.clone())
    }

    async fn should_bid_based_on_usage(
        &self,
        _request: &BidStrategyRequest,
        _usage: &ResourceUsage,
    ) -> Result<BidStrategyResponse, BidStrategyError> {
        Ok(self.response.clone())
    }
}
