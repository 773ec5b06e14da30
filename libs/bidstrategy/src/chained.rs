use std::sync::Arc;

use async_trait::async_trait;
use bidmesh_model::ResourceUsage;

use crate::error::BidStrategyError;
use crate::types::{BidStrategy, BidStrategyRequest, BidStrategyResponse};

/// Asks each strategy in order.
///
/// The first rejection wins and stops evaluation. Otherwise the first
/// "wait" is returned, and the chain bids only if every member bids. An
/// empty chain bids.
#[derive(Clone, Default)]
pub struct ChainedStrategy {
    strategies: Vec<Arc<dyn BidStrategy>>,
}

impl ChainedStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, strategy: Arc<dyn BidStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }
}

#[async_trait]
impl BidStrategy for ChainedStrategy {
    async fn should_bid(
        &self,
        request: &BidStrategyRequest,
    ) -> Result<BidStrategyResponse, BidStrategyError> {
        let mut wait = None;
        for strategy in &self.strategies {
            let response = strategy.should_bid(request).await?;
            if response.is_reject() {
                return Ok(response);
            }
            if response.should_wait() && wait.is_none() {
                wait = Some(response);
            }
        }
        Ok(wait.unwrap_or_else(BidStrategyResponse::bid))
    }

    async fn should_bid_based_on_usage(
        &self,
        request: &BidStrategyRequest,
        usage: &ResourceUsage,
    ) -> Result<BidStrategyResponse, BidStrategyError> {
        let mut wait = None;
        for strategy in &self.strategies {
            let response = strategy.should_bid_based_on_usage(request, usage).await?;
            if response.is_reject() {
                return Ok(response);
            }
            if response.should_wait() && wait.is_none() {
                wait = Some(response);
            }
        }
        Ok(wait.unwrap_or_else(BidStrategyResponse::bid))
    }
}

impl std::fmt::Debug for ChainedStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainedStrategy")
            .field("strategies", &self.strategies.len())
            .finish()
    }
}
