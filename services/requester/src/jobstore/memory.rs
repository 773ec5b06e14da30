use std::collections::HashMap;

use async_trait::async_trait;
use bidmesh_id::JobId;
use bidmesh_model::{Job, JobState};
use tokio::sync::RwLock;

use super::{check_update, JobQuery, JobStore, StoreError};

/// Job store held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, (Job, JobState)>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, job: &Job) -> Result<JobState, StoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(job.id()) {
            return Err(StoreError::AlreadyExists(*job.id()));
        }
        let state = JobState::new(*job.id());
        jobs.insert(*job.id(), (job.clone(), state.clone()));
        Ok(state)
    }

    async fn get_job(&self, id: &JobId) -> Result<Job, StoreError> {
        self.jobs
            .read()
            .await
            .get(id)
            .map(|(job, _)| job.clone())
            .ok_or(StoreError::NotFound(*id))
    }

    async fn get_job_state(&self, id: &JobId) -> Result<JobState, StoreError> {
        self.jobs
            .read()
            .await
            .get(id)
            .map(|(_, state)| state.clone())
            .ok_or(StoreError::NotFound(*id))
    }

    async fn update_job_state(
        &self,
        state: &JobState,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let (_, stored) = jobs
            .get_mut(&state.job_id)
            .ok_or(StoreError::NotFound(state.job_id))?;
        check_update(stored, state, expected_version)?;
        *stored = state.clone();
        Ok(())
    }

    async fn list_jobs(&self, query: &JobQuery) -> Result<Vec<(Job, JobState)>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut found: Vec<_> = jobs
            .values()
            .filter(|(_, state)| query.matches(state))
            .cloned()
            .collect();
        found.sort_by_key(|(job, _)| *job.id());
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobstore::conformance;

    #[tokio::test]
    async fn test_create_then_get() {
        conformance::create_then_get(&InMemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn test_duplicate_create_fails() {
        conformance::duplicate_create_fails(&InMemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn test_missing_job() {
        conformance::missing_job(&InMemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn test_conditional_update() {
        conformance::conditional_update(&InMemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn test_terminal_is_final() {
        conformance::terminal_is_final(&InMemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn test_list_by_state() {
        conformance::list_by_state(&InMemoryJobStore::new()).await;
    }
}
