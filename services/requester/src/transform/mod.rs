//! Mutators applied to a submitted job before it is persisted.
//!
//! Transforms run in registration order. Each may rewrite the job in place
//! and reports whether it changed anything. The first failure aborts the
//! submission. Transforms must be idempotent: a retried submission runs the
//! pipeline again over an already-transformed job.

mod inline;
mod requester_info;
mod timeout;

pub use inline::InlineStoragePinner;
pub use requester_info::RequesterInfoStamper;
pub use timeout::TimeoutApplier;

use std::sync::Arc;

use async_trait::async_trait;
use bidmesh_id::NodeId;
use bidmesh_model::Job;
use bidmesh_storage::{ContentPinner, StorageError};
use thiserror::Error;
use tracing::debug;

use crate::config::RequesterConfig;

#[derive(Debug, Error)]
pub enum TransformError {
    /// A transform that pins data could not store it.
    #[error("{transform}: {source}")]
    Storage {
        transform: &'static str,
        #[source]
        source: StorageError,
    },
}

#[async_trait]
pub trait Transformer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Rewrites `job` in place. Returns `true` if anything changed.
    async fn transform(&self, job: &mut Job) -> Result<bool, TransformError>;
}

/// Ordered list of transforms.
#[derive(Clone, Default)]
pub struct TransformPipeline {
    transformers: Vec<Arc<dyn Transformer>>,
}

impl TransformPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformers.push(transformer);
        self
    }

    /// The requester's submission pipeline: pin inline data, apply
    /// timeouts, stamp requester identity.
    pub fn standard(
        config: &RequesterConfig,
        node_id: NodeId,
        public_key: &[u8],
        pinner: Arc<dyn ContentPinner>,
    ) -> Self {
        Self::new()
            .with(Arc::new(InlineStoragePinner::new(pinner)))
            .with(Arc::new(TimeoutApplier::new(
                config.min_job_execution_timeout,
                config.default_job_execution_timeout,
            )))
            .with(Arc::new(RequesterInfoStamper::new(node_id, public_key)))
    }

    /// Runs every transform. Returns `true` if any of them changed the job.
    pub async fn apply(&self, job: &mut Job) -> Result<bool, TransformError> {
        let mut modified = false;
        for transformer in &self.transformers {
            let changed = transformer.transform(job).await?;
            if changed {
                debug!(job_id = %job.id(), transform = transformer.name(), "job transformed");
            }
            modified |= changed;
        }
        Ok(modified)
    }
}

impl std::fmt::Debug for TransformPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.transformers.iter().map(|t| t.name()))
            .finish()
    }
}
