//! Authoritative job records.
//!
//! A store holds exactly one [`Job`] and one [`JobState`] per job ID. State
//! writes are conditional on the caller's expected version, and terminal
//! states cannot be overwritten.

mod memory;
mod sqlite;

pub use memory::InMemoryJobStore;
pub use sqlite::SqliteJobStore;

use async_trait::async_trait;
use bidmesh_id::JobId;
use bidmesh_model::{Job, JobState, JobStateType};
use thiserror::Error;

/// Errors from job store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    /// The stored state is terminal and cannot change.
    #[error("job {job_id} is {state} and cannot be modified")]
    InvalidState { job_id: JobId, state: JobStateType },

    /// Someone else updated the job first.
    #[error("job {job_id} version conflict: expected {expected}, found {actual}")]
    VersionConflict {
        job_id: JobId,
        expected: u64,
        actual: u64,
    },

    #[error("job store backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Backend(format!("record encoding: {err}"))
    }
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    /// Only jobs in one of these states. Empty means any state.
    pub states: Vec<JobStateType>,
}

impl JobQuery {
    pub fn in_states(states: impl IntoIterator<Item = JobStateType>) -> Self {
        Self {
            states: states.into_iter().collect(),
        }
    }

    pub(crate) fn matches(&self, state: &JobState) -> bool {
        self.states.is_empty() || self.states.contains(&state.state)
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persists a new job with a fresh `Created` state.
    ///
    /// Fails with [`StoreError::AlreadyExists`] if the ID is taken.
    async fn create_job(&self, job: &Job) -> Result<JobState, StoreError>;

    async fn get_job(&self, id: &JobId) -> Result<Job, StoreError>;

    async fn get_job_state(&self, id: &JobId) -> Result<JobState, StoreError>;

    /// Replaces the job's state if the stored version is `expected_version`.
    async fn update_job_state(
        &self,
        state: &JobState,
        expected_version: u64,
    ) -> Result<(), StoreError>;

    async fn list_jobs(&self, query: &JobQuery) -> Result<Vec<(Job, JobState)>, StoreError>;
}

/// Checks shared by every backend before a conditional state write.
pub(crate) fn check_update(
    stored: &JobState,
    next: &JobState,
    expected_version: u64,
) -> Result<(), StoreError> {
    if stored.version != expected_version {
        return Err(StoreError::VersionConflict {
            job_id: stored.job_id,
            expected: expected_version,
            actual: stored.version,
        });
    }
    if stored.state.is_terminal() {
        return Err(StoreError::InvalidState {
            job_id: stored.job_id,
            state: stored.state,
        });
    }
    if next.version <= stored.version {
        return Err(StoreError::Backend(format!(
            "job {} update must advance version past {}",
            stored.job_id, stored.version
        )));
    }
    Ok(())
}
