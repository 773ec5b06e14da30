use async_trait::async_trait;
use bidmesh_id::NodeId;
use bidmesh_model::{Job, ResourceUsage, Spec};
use serde::{Deserialize, Serialize};

use crate::error::BidStrategyError;

/// What a strategy is asked to decide on.
#[derive(Debug, Clone)]
pub struct BidStrategyRequest {
    pub node_id: NodeId,
    pub job: Job,
}

impl BidStrategyRequest {
    pub fn new(node_id: NodeId, job: Job) -> Self {
        Self { node_id, job }
    }

    pub fn probe_data(&self) -> ProbeData {
        ProbeData {
            node_id: self.node_id,
            job_id: *self.job.id(),
            spec: self.job.spec.clone(),
        }
    }
}

/// JSON payload sent to HTTP and exec probes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeData {
    pub node_id: NodeId,
    pub job_id: bidmesh_id::JobId,
    pub spec: Spec,
}

/// Tri-state bid decision.
///
/// Constructed only through [`bid`](Self::bid), [`wait`](Self::wait) and
/// [`reject`](Self::reject), so `should_bid` and `should_wait` are never
/// both set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawResponse", rename_all = "camelCase")]
pub struct BidStrategyResponse {
    should_bid: bool,
    should_wait: bool,
    reason: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawResponse {
    #[serde(default)]
    should_bid: bool,
    #[serde(default)]
    should_wait: bool,
    #[serde(default)]
    reason: String,
}

impl From<RawResponse> for BidStrategyResponse {
    // A remote answer claiming both is treated as "wait".
    fn from(raw: RawResponse) -> Self {
        if raw.should_wait {
            Self::wait(raw.reason)
        } else if raw.should_bid {
            Self {
                reason: raw.reason,
                ..Self::bid()
            }
        } else {
            Self::reject(raw.reason)
        }
    }
}

impl BidStrategyResponse {
    pub fn bid() -> Self {
        Self {
            should_bid: true,
            should_wait: false,
            reason: String::new(),
        }
    }

    pub fn wait(reason: impl Into<String>) -> Self {
        Self {
            should_bid: false,
            should_wait: true,
            reason: reason.into(),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            should_bid: false,
            should_wait: false,
            reason: reason.into(),
        }
    }

    pub fn should_bid(&self) -> bool {
        self.should_bid
    }

    pub fn should_wait(&self) -> bool {
        self.should_wait
    }

    pub fn is_reject(&self) -> bool {
        !self.should_bid && !self.should_wait
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// A bid decision policy.
///
/// Implementations must not mutate shared job or node state while deciding.
#[async_trait]
pub trait BidStrategy: Send + Sync {
    async fn should_bid(
        &self,
        request: &BidStrategyRequest,
    ) -> Result<BidStrategyResponse, BidStrategyError>;

    /// Like [`should_bid`](Self::should_bid), given the job's parsed
    /// resource request.
    async fn should_bid_based_on_usage(
        &self,
        request: &BidStrategyRequest,
        usage: &ResourceUsage,
    ) -> Result<BidStrategyResponse, BidStrategyError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(r#"{"shouldBid": true}"#, true, false)]
    #[case(r#"{"shouldWait": true, "reason": "pending"}"#, false, true)]
    #[case(r#"{"shouldBid": true, "shouldWait": true}"#, false, true)]
    #[case(r#"{"reason": "busy"}"#, false, false)]
    #[case(r#"{}"#, false, false)]
    fn test_decoded_responses_are_never_bid_and_wait(
        #[case] body: &str,
        #[case] bid: bool,
        #[case] wait: bool,
    ) {
        let response: BidStrategyResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.should_bid(), bid);
        assert_eq!(response.should_wait(), wait);
        assert!(!(response.should_bid() && response.should_wait()));
    }

    #[test]
    fn test_serialized_field_names() {
        let json = serde_json::to_value(BidStrategyResponse::reject("no")).unwrap();
        assert_eq!(json["shouldBid"], false);
        assert_eq!(json["shouldWait"], false);
        assert_eq!(json["reason"], "no");
    }
}
