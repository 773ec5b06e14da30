//! Submit, approve and cancel operations exposed to clients.

use std::sync::Arc;

use bidmesh_bidstrategy::{BidStrategy, BidStrategyRequest, BidStrategyResponse};
use bidmesh_events::{ActorType, JobCreatedPayload, JobEventPayload};
use bidmesh_id::JobId;
use bidmesh_model::{Job, JobCreatePayload, JobState};
use tracing::{info, instrument, warn};

use crate::error::{RequesterError, SubmitJobError};
use crate::queue::{CancelJobRequest, CancelJobResult, SchedulingQueue};
use crate::transform::TransformPipeline;

/// A decision on a job whose bid was deferred.
#[derive(Debug, Clone)]
pub struct ApproveJobRequest {
    /// Identity of whoever is approving.
    pub client_id: String,
    pub job_id: JobId,
    pub response: BidStrategyResponse,
}

/// Entry point for job submission.
pub struct RequesterEndpoint {
    queue: Arc<SchedulingQueue>,
    transforms: TransformPipeline,
    selector: Arc<dyn BidStrategy>,
    job_approver: String,
}

impl RequesterEndpoint {
    pub fn new(
        queue: Arc<SchedulingQueue>,
        transforms: TransformPipeline,
        selector: Arc<dyn BidStrategy>,
        job_approver: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            transforms,
            selector,
            job_approver: job_approver.into(),
        }
    }

    /// Builds, persists and schedules a new job.
    ///
    /// The returned job has been persisted unless the error says otherwise:
    /// validation and transform failures abort before anything is stored.
    /// A deferred bid returns the job in `Bidding`, awaiting
    /// [`approve_job`](Self::approve_job).
    #[instrument(skip_all, fields(client_id = %payload.client_id))]
    pub async fn submit_job(&self, payload: JobCreatePayload) -> Result<Job, SubmitJobError> {
        let mut job = Job::new(payload.client_id, payload.spec);
        job.api_version = payload.api_version;

        job.spec
            .validate()
            .map_err(|e| SubmitJobError::new(&job, RequesterError::Validation(e)))?;
        self.transforms
            .apply(&mut job)
            .await
            .map_err(|e| SubmitJobError::new(&job, e))?;

        let job_id = *job.id();
        let store = self.queue.store();
        store
            .create_job(&job)
            .await
            .map_err(|e| SubmitJobError::new(&job, e))?;
        self.queue
            .emit(
                job_id,
                ActorType::User,
                JobEventPayload::JobCreated(JobCreatedPayload {
                    client_id: job.metadata.client_id.clone(),
                    shard_count: job.spec.shard_count(),
                }),
            )
            .await;
        info!(job_id = %job_id, "Job created");

        self.queue
            .enqueue_job(&job_id)
            .await
            .map_err(|e| SubmitJobError::new(&job, e))?;
        if !self
            .queue
            .begin_bidding(&job_id)
            .await
            .map_err(|e| SubmitJobError::new(&job, e))?
        {
            return Ok(job);
        }

        let request = BidStrategyRequest::new(self.queue.node_id(), job.clone());
        let response = match self.selector.should_bid(&request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "Bid strategy failed");
                let cancel = CancelJobRequest::by_system(job_id, format!("bid strategy failed: {err}"));
                if let Err(cancel_err) = self.queue.cancel_job(cancel).await {
                    warn!(job_id = %job_id, error = %cancel_err, "Failed to cancel job");
                }
                return Err(SubmitJobError::new(&job, err));
            }
        };

        self.handle_bid_response(&job_id, &response)
            .await
            .map_err(|e| SubmitJobError::new(&job, e))?;
        Ok(job)
    }

    /// Applies a deferred decision.
    ///
    /// Only the configured approver may approve. An empty approver
    /// configuration authorises nobody.
    #[instrument(skip_all, fields(job_id = %request.job_id))]
    pub async fn approve_job(&self, request: ApproveJobRequest) -> Result<(), RequesterError> {
        if self.job_approver.is_empty()
            || request.client_id.is_empty()
            || request.client_id != self.job_approver
        {
            warn!(client_id = %request.client_id, "Rejected approval from unknown client");
            return Err(RequesterError::Unauthorized);
        }
        self.handle_bid_response(&request.job_id, &request.response)
            .await
    }

    pub async fn cancel_job(
        &self,
        request: CancelJobRequest,
    ) -> Result<CancelJobResult, RequesterError> {
        self.queue.cancel_job(request).await
    }

    pub async fn get_job(&self, job_id: &JobId) -> Result<(Job, JobState), RequesterError> {
        let store = self.queue.store();
        let job = store.get_job(job_id).await?;
        let state = store.get_job_state(job_id).await?;
        Ok((job, state))
    }

    async fn handle_bid_response(
        &self,
        job_id: &JobId,
        response: &BidStrategyResponse,
    ) -> Result<(), RequesterError> {
        if response.should_wait() {
            info!(job_id = %job_id, reason = %response.reason(), "Job awaiting approval");
            return Ok(());
        }

        if response.should_bid() {
            self.queue.start_job(job_id).await?;
            return Ok(());
        }

        let reason = format!("job rejected: {}", response.reason());
        self.queue
            .cancel_job(CancelJobRequest::by_system(*job_id, reason))
            .await?;
        Ok(())
    }
}
