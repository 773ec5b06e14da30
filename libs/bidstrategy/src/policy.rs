//! Operator job selection policy.

use std::sync::Arc;

use async_trait::async_trait;
use bidmesh_model::{Network, ResourceUsage, StorageSpec};
use bidmesh_storage::{StorageError, StorageProviders};
use serde::{Deserialize, Serialize};

use crate::error::BidStrategyError;
use crate::probe::{ExecProbeStrategy, HttpProbeStrategy};
use crate::types::{BidStrategy, BidStrategyRequest, BidStrategyResponse};

/// Where a job's input data must live for this node to take it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Locality {
    /// Only bid if every input is already on this node.
    Local,
    #[default]
    Anywhere,
}

impl std::str::FromStr for Locality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Locality::Local),
            "anywhere" => Ok(Locality::Anywhere),
            other => Err(format!("unknown locality '{other}'")),
        }
    }
}

/// Which jobs a node is willing to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct JobSelectionPolicy {
    #[serde(default)]
    pub locality: Locality,

    /// Decline jobs without any input data.
    #[serde(default)]
    pub reject_stateless: bool,

    /// Accept jobs that ask for network access.
    #[serde(default)]
    pub accept_networked: bool,

    /// URL of an HTTP bid probe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_http: Option<String>,

    /// Shell command used as an exec bid probe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_exec: Option<String>,
}

/// Answers whether a set of volumes is available on this node.
#[async_trait]
pub trait InputLocality: Send + Sync {
    async fn has_all_locally(&self, specs: &[StorageSpec]) -> Result<bool, StorageError>;
}

#[async_trait]
impl InputLocality for StorageProviders {
    async fn has_all_locally(&self, specs: &[StorageSpec]) -> Result<bool, StorageError> {
        StorageProviders::has_all_locally(self, specs).await
    }
}

/// Applies a [`JobSelectionPolicy`], then its probes.
pub struct JobSelectionStrategy {
    policy: JobSelectionPolicy,
    locality: Arc<dyn InputLocality>,
    http_probe: Option<HttpProbeStrategy>,
    exec_probe: Option<ExecProbeStrategy>,
}

impl JobSelectionStrategy {
    pub fn new(policy: JobSelectionPolicy, locality: Arc<dyn InputLocality>) -> Self {
        let http_probe = policy.probe_http.clone().map(HttpProbeStrategy::new);
        let exec_probe = policy.probe_exec.clone().map(ExecProbeStrategy::new);
        Self {
            policy,
            locality,
            http_probe,
            exec_probe,
        }
    }
}

#[async_trait]
impl BidStrategy for JobSelectionStrategy {
    async fn should_bid(
        &self,
        request: &BidStrategyRequest,
    ) -> Result<BidStrategyResponse, BidStrategyError> {
        let spec = &request.job.spec;
        let inputs: Vec<StorageSpec> = spec.all_inputs().cloned().collect();

        if self.policy.reject_stateless && inputs.is_empty() {
            return Ok(BidStrategyResponse::reject(
                "node does not accept stateless jobs",
            ));
        }

        if spec.network != Network::None && !self.policy.accept_networked {
            return Ok(BidStrategyResponse::reject(
                "node does not accept networked jobs",
            ));
        }

        if self.policy.locality == Locality::Local
            && !self.locality.has_all_locally(&inputs).await?
        {
            return Ok(BidStrategyResponse::reject(
                "node only accepts jobs whose inputs are local",
            ));
        }

        if let Some(probe) = &self.http_probe {
            let response = probe.should_bid(request).await?;
            if !response.should_bid() {
                return Ok(response);
            }
        }

        if let Some(probe) = &self.exec_probe {
            let response = probe.should_bid(request).await?;
            if !response.should_bid() {
                return Ok(response);
            }
        }

        Ok(BidStrategyResponse::bid())
    }

    async fn should_bid_based_on_usage(
        &self,
        _request: &BidStrategyRequest,
        _usage: &ResourceUsage,
    ) -> Result<BidStrategyResponse, BidStrategyError> {
        Ok(BidStrategyResponse::bid())
    }
}

impl std::fmt::Debug for JobSelectionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSelectionStrategy")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidmesh_id::NodeId;
    use bidmesh_model::{DockerSpec, Job, Spec, StorageSource};
    use bidmesh_storage::{ContentStorage, ContentStore};

    fn request(inputs: Vec<StorageSpec>, network: Network) -> BidStrategyRequest {
        let spec = Spec {
            docker: DockerSpec {
                image: "ubuntu".into(),
                ..Default::default()
            },
            inputs,
            network,
            ..Default::default()
        };
        BidStrategyRequest::new(NodeId::new(), Job::new("client", spec))
    }

    fn content(cid: String) -> StorageSpec {
        StorageSpec {
            name: "data".into(),
            path: "/inputs".into(),
            source: StorageSource::Content { cid },
        }
    }

    fn strategy(policy: JobSelectionPolicy, store: ContentStore) -> JobSelectionStrategy {
        let providers = StorageProviders::new().register(Arc::new(ContentStorage::new(store)));
        JobSelectionStrategy::new(policy, Arc::new(providers))
    }

    #[tokio::test]
    async fn test_default_policy_bids() {
        let dir = tempfile::tempdir().unwrap();
        let s = strategy(JobSelectionPolicy::default(), ContentStore::new(dir.path()));
        let response = s.should_bid(&request(vec![], Network::None)).await.unwrap();
        assert!(response.should_bid());
    }

    #[tokio::test]
    async fn test_reject_stateless() {
        let dir = tempfile::tempdir().unwrap();
        let policy = JobSelectionPolicy {
            reject_stateless: true,
            ..Default::default()
        };
        let s = strategy(policy, ContentStore::new(dir.path()));
        let response = s.should_bid(&request(vec![], Network::None)).await.unwrap();
        assert!(response.is_reject());
    }

    #[tokio::test]
    async fn test_networked_jobs_need_opt_in() {
        let dir = tempfile::tempdir().unwrap();
        let s = strategy(JobSelectionPolicy::default(), ContentStore::new(dir.path()));
        let response = s.should_bid(&request(vec![], Network::Full)).await.unwrap();
        assert!(response.is_reject());

        let policy = JobSelectionPolicy {
            accept_networked: true,
            ..Default::default()
        };
        let s = strategy(policy, ContentStore::new(dir.path()));
        let response = s.should_bid(&request(vec![], Network::Full)).await.unwrap();
        assert!(response.should_bid());
    }

    #[tokio::test]
    async fn test_local_locality() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        let present = store.put_bytes(b"local data").await.unwrap();
        let policy = JobSelectionPolicy {
            locality: Locality::Local,
            ..Default::default()
        };
        let s = strategy(policy, store);

        let here = s
            .should_bid(&request(vec![content(present)], Network::None))
            .await
            .unwrap();
        assert!(here.should_bid());

        let elsewhere = s
            .should_bid(&request(vec![content("f".repeat(64))], Network::None))
            .await
            .unwrap();
        assert!(elsewhere.is_reject());
    }

    #[tokio::test]
    async fn test_exec_probe_consulted_after_policy() {
        let dir = tempfile::tempdir().unwrap();
        let policy = JobSelectionPolicy {
            probe_exec: Some("exit 1".into()),
            ..Default::default()
        };
        let s = strategy(policy, ContentStore::new(dir.path()));
        let response = s.should_bid(&request(vec![], Network::None)).await.unwrap();
        assert!(response.is_reject());
        assert!(response.reason().contains("exec probe"));
    }

    #[test]
    fn test_locality_from_str() {
        assert_eq!("LOCAL".parse::<Locality>().unwrap(), Locality::Local);
        assert!("nearby".parse::<Locality>().is_err());
    }
}
