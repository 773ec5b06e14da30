//! Requester error types.

use bidmesh_bidstrategy::BidStrategyError;
use bidmesh_id::JobId;
use bidmesh_model::{Job, JobStateType, ModelError};
use thiserror::Error;

use crate::dispatch::DispatchError;
use crate::jobstore::StoreError;
use crate::transform::TransformError;

/// Errors from requester operations.
#[derive(Debug, Error)]
pub enum RequesterError {
    /// The job spec is malformed. Nothing was persisted.
    #[error("invalid job: {0}")]
    Validation(ModelError),

    /// The job is in a state that does not allow the operation.
    #[error("job {job_id} is {state}: cannot {operation}")]
    StateConflict {
        job_id: JobId,
        state: JobStateType,
        operation: &'static str,
    },

    /// The approving identity is not the configured approver.
    #[error("approval submitted by unknown client")]
    Unauthorized,

    #[error(transparent)]
    Store(StoreError),

    #[error("job transform failed: {0}")]
    Transform(#[from] TransformError),

    #[error("bid strategy failed: {0}")]
    BidStrategy(#[from] BidStrategyError),

    /// Shards could not be handed to compute nodes.
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
}

impl From<StoreError> for RequesterError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidState { job_id, state } => RequesterError::StateConflict {
                job_id,
                state,
                operation: "update",
            },
            other => RequesterError::Store(other),
        }
    }
}

impl RequesterError {
    pub fn is_state_conflict(&self) -> bool {
        matches!(self, RequesterError::StateConflict { .. })
    }
}

/// A failed submission, carrying the job as it was built so far.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct SubmitJobError {
    pub job: Box<Job>,
    #[source]
    pub source: RequesterError,
}

impl SubmitJobError {
    pub(crate) fn new(job: &Job, source: impl Into<RequesterError>) -> Self {
        Self {
            job: Box::new(job.clone()),
            source: source.into(),
        }
    }
}
