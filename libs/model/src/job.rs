//! Job identity and shards.

use bidmesh_id::{JobId, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::spec::{Spec, StorageSpec};

/// Current job API version.
pub const API_VERSION: &str = "v1";

/// Identity attached to a job at submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub id: JobId,

    /// Opaque identity of the submitting client.
    pub client_id: String,

    pub created_at: DateTime<Utc>,
}

/// Requester identity stamped onto a job so compute nodes can report back
/// to, and authenticate, the right requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequesterInfo {
    pub node_id: NodeId,

    /// Base64-encoded public key.
    pub public_key: String,
}

/// A submitted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub api_version: String,
    pub metadata: Metadata,
    pub spec: Spec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<RequesterInfo>,
}

impl Job {
    /// Builds a new job with a fresh ID.
    pub fn new(client_id: impl Into<String>, spec: Spec) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            metadata: Metadata {
                id: JobId::new(),
                client_id: client_id.into(),
                created_at: Utc::now(),
            },
            spec,
            requester: None,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.metadata.id
    }

    /// All shards of this job, in index order.
    pub fn shards(&self) -> impl Iterator<Item = JobShard> + '_ {
        (0..self.spec.shard_count()).map(move |index| JobShard {
            job: self.clone(),
            index,
        })
    }
}

/// What a client sends to submit a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCreatePayload {
    pub client_id: String,

    #[serde(default = "default_api_version")]
    pub api_version: String,

    pub spec: Spec,
}

fn default_api_version() -> String {
    API_VERSION.to_string()
}

/// One `(job, index)` unit of execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobShard {
    pub job: Job,
    pub index: u32,
}

impl JobShard {
    /// Stable shard identity, `<job id>:<index>`.
    pub fn id(&self) -> String {
        format!("{}:{}", self.job.metadata.id, self.index)
    }

    /// The shard-specific slice of `spec.inputs`.
    ///
    /// With sharding configured, inputs are split into consecutive batches
    /// and shard `i` gets batch `i` (possibly empty). Without sharding every
    /// shard sees every input.
    pub fn inputs(&self) -> Vec<StorageSpec> {
        let inputs = &self.job.spec.inputs;
        match self.job.spec.sharding {
            Some(sharding) => {
                let batch = sharding.batch_size.max(1) as usize;
                inputs
                    .chunks(batch)
                    .nth(self.index as usize)
                    .map(<[StorageSpec]>::to_vec)
                    .unwrap_or_default()
            }
            None => inputs.clone(),
        }
    }

    /// Shared contexts followed by this shard's inputs.
    pub fn volumes(&self) -> Vec<StorageSpec> {
        let mut volumes = self.job.spec.contexts.clone();
        volumes.extend(self.inputs());
        volumes
    }
}
