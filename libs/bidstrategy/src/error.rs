use std::time::Duration;

use bidmesh_model::ModelError;
use bidmesh_storage::StorageError;
use thiserror::Error;

/// Bid strategy errors. Callers treat any error as a decline.
#[derive(Debug, Error)]
pub enum BidStrategyError {
    /// HTTP probe transport failure.
    #[error("http probe request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The exec probe could not be run.
    #[error("exec probe failed: {0}")]
    Exec(#[from] std::io::Error),

    /// A probe did not answer in time.
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("probe payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The job's resource request could not be interpreted.
    #[error(transparent)]
    Resources(#[from] ModelError),

    /// Input locality could not be determined.
    #[error("locality check failed: {0}")]
    Storage(#[from] StorageError),
}
