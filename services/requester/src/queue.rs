//! Per-job lifecycle transitions.
//!
//! Every operation that writes a job's state takes that job's lock first,
//! so transitions for one job are applied one at a time in the order the
//! lock is granted. Different jobs never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bidmesh_events::{
    ActorType, EventEnvelope, EventSink, JobEventPayload, JobStateChangedPayload,
    ShardResultsPublishedPayload, ShardStateChangedPayload,
};
use bidmesh_id::{JobId, NodeId};
use bidmesh_model::{
    CancelSource, JobState, JobStateType, ModelError, ShardReport, ShardReportKind,
    ShardStateType,
};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, instrument, warn};

use crate::dispatch::ShardDispatcher;
use crate::error::RequesterError;
use crate::jobstore::JobStore;

/// Request to move a job to `Cancelled`.
#[derive(Debug, Clone)]
pub struct CancelJobRequest {
    pub job_id: JobId,
    pub reason: String,
    /// `true` when a client asked for it, `false` for system decisions.
    pub user_triggered: bool,
}

impl CancelJobRequest {
    pub fn by_user(job_id: JobId, reason: impl Into<String>) -> Self {
        Self {
            job_id,
            reason: reason.into(),
            user_triggered: true,
        }
    }

    pub fn by_system(job_id: JobId, reason: impl Into<String>) -> Self {
        Self {
            job_id,
            reason: reason.into(),
            user_triggered: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CancelJobResult {
    pub state: JobState,
    /// The job was already cancelled and nothing changed.
    pub already_cancelled: bool,
}

/// Drives jobs from `Created` to a terminal state.
pub struct SchedulingQueue {
    node_id: NodeId,
    store: Arc<dyn JobStore>,
    dispatcher: Arc<dyn ShardDispatcher>,
    events: Arc<dyn EventSink>,
    locks: Mutex<HashMap<JobId, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held while a job's state is being changed.
struct JobLock<'a> {
    locks: &'a Mutex<HashMap<JobId, Arc<tokio::sync::Mutex<()>>>>,
    job_id: JobId,
    entry: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for JobLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map and this lock reference the entry: nobody is waiting.
        if Arc::strong_count(&self.entry) == 2 {
            locks.remove(&self.job_id);
        }
    }
}

impl SchedulingQueue {
    pub fn new(
        node_id: NodeId,
        store: Arc<dyn JobStore>,
        dispatcher: Arc<dyn ShardDispatcher>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            node_id,
            store,
            dispatcher,
            events,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    async fn lock(&self, job_id: JobId) -> JobLock<'_> {
        let entry = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(job_id).or_default().clone()
        };
        let guard = entry.clone().lock_owned().await;
        JobLock {
            locks: &self.locks,
            job_id,
            entry,
            guard: Some(guard),
        }
    }

    /// Moves a `Created` job to `Queued`. Enqueuing a job that is already
    /// queued returns its current state unchanged.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn enqueue_job(&self, job_id: &JobId) -> Result<JobState, RequesterError> {
        let _lock = self.lock(*job_id).await;
        let mut state = self.store.get_job_state(job_id).await?;

        match state.state {
            JobStateType::Queued => Ok(state),
            JobStateType::Created => {
                let expected = state.version;
                state
                    .transition(JobStateType::Queued, None)
                    .map_err(RequesterError::Validation)?;
                self.commit(&state, JobStateType::Created, expected, ActorType::System)
                    .await?;
                debug!("Job queued");
                Ok(state)
            }
            other => Err(conflict(*job_id, other, "enqueue")),
        }
    }

    /// Moves a `Queued` job to `Bidding`.
    ///
    /// Returns `false` if bidding had already begun, so callers solicit bids
    /// at most once per submission.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn begin_bidding(&self, job_id: &JobId) -> Result<bool, RequesterError> {
        let _lock = self.lock(*job_id).await;
        let mut state = self.store.get_job_state(job_id).await?;

        match state.state {
            JobStateType::Bidding => Ok(false),
            JobStateType::Queued => {
                let expected = state.version;
                state
                    .transition(JobStateType::Bidding, None)
                    .map_err(RequesterError::Validation)?;
                self.commit(&state, JobStateType::Queued, expected, ActorType::System)
                    .await?;
                Ok(true)
            }
            other => Err(conflict(*job_id, other, "begin bidding")),
        }
    }

    /// Moves a `Queued` or `Bidding` job to `Running` and dispatches its
    /// shards. If dispatch fails the job ends in `Error`.
    ///
    /// Returns the state observed after dispatch, which is already
    /// `Cancelled` if a cancel raced the dispatch.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn start_job(&self, job_id: &JobId) -> Result<JobState, RequesterError> {
        let job = self.store.get_job(job_id).await?;
        let state = {
            let _lock = self.lock(*job_id).await;
            let mut state = self.store.get_job_state(job_id).await?;
            let previous = state.state;
            if !matches!(previous, JobStateType::Queued | JobStateType::Bidding) {
                return Err(conflict(*job_id, previous, "start"));
            }

            let expected = state.version;
            state
                .transition(JobStateType::Running, None)
                .map_err(RequesterError::Validation)?;
            self.commit(&state, previous, expected, ActorType::System)
                .await?;
            state
        };

        info!(shards = job.spec.shard_count(), "Job started");

        if let Err(err) = self.dispatcher.dispatch(&job).await {
            warn!(error = %err, "Shard dispatch failed");
            let _lock = self.lock(*job_id).await;
            let mut state = self.store.get_job_state(job_id).await?;
            if state.state == JobStateType::Running {
                let expected = state.version;
                state
                    .transition(JobStateType::Error, Some(format!("dispatch failed: {err}")))
                    .map_err(RequesterError::Validation)?;
                self.commit(&state, JobStateType::Running, expected, ActorType::System)
                    .await?;
            }
            return Err(err.into());
        }

        // A cancel that committed between the transition and the dispatch
        // found nothing to stop on the compute side. Repeat it now.
        let current = self.store.get_job_state(job_id).await?;
        if current.state != JobStateType::Running {
            debug!(state = %current.state, "Job left Running during dispatch");
            if current.state == JobStateType::Cancelled {
                let reason = current.reason.as_deref().unwrap_or("job cancelled");
                if let Err(err) = self.dispatcher.cancel(job_id, reason).await {
                    warn!(error = %err, "Failed to cancel dispatched shards");
                }
            }
            return Ok(current);
        }

        Ok(state)
    }

    /// Cancels a job that has not finished.
    ///
    /// Cancelling an already cancelled job succeeds without changing it.
    /// Cancelling a `Completed` or `Error` job is a state conflict.
    #[instrument(skip_all, fields(job_id = %request.job_id))]
    pub async fn cancel_job(
        &self,
        request: CancelJobRequest,
    ) -> Result<CancelJobResult, RequesterError> {
        let job_id = request.job_id;
        let (state, was_running) = {
            let _lock = self.lock(job_id).await;
            let mut state = self.store.get_job_state(&job_id).await?;
            let previous = state.state;

            match previous {
                JobStateType::Cancelled => {
                    debug!("Job already cancelled");
                    return Ok(CancelJobResult {
                        state,
                        already_cancelled: true,
                    });
                }
                JobStateType::Completed | JobStateType::Error => {
                    return Err(conflict(job_id, previous, "cancel"));
                }
                _ => {}
            }

            let (source, actor) = if request.user_triggered {
                (CancelSource::User, ActorType::User)
            } else {
                (CancelSource::System, ActorType::System)
            };
            let expected = state.version;
            state
                .transition(JobStateType::Cancelled, Some(request.reason.clone()))
                .map_err(RequesterError::Validation)?;
            state.cancelled_by = Some(source);
            self.commit(&state, previous, expected, actor).await?;
            (state, previous == JobStateType::Running)
        };

        info!(reason = %request.reason, user_triggered = request.user_triggered, "Job cancelled");

        if was_running {
            if let Err(err) = self.dispatcher.cancel(&job_id, &request.reason).await {
                warn!(error = %err, "Failed to cancel in-flight shards");
            }
        }

        Ok(CancelJobResult {
            state,
            already_cancelled: false,
        })
    }

    /// Records a compute node's report for one shard.
    ///
    /// Reports for finished jobs are ignored. Once every shard of a running
    /// job is terminal the job becomes `Completed` if all of them completed,
    /// `Error` otherwise.
    #[instrument(skip_all, fields(job_id = %report.job_id, shard_index = report.shard_index))]
    pub async fn report_shard(&self, report: ShardReport) -> Result<JobState, RequesterError> {
        let job = self.store.get_job(&report.job_id).await?;
        let shard_count = job.spec.shard_count();
        if report.shard_index >= shard_count {
            return Err(RequesterError::Validation(ModelError::InvalidSpec(format!(
                "shard {} out of range for a job with {shard_count} shards",
                report.shard_index
            ))));
        }

        let _lock = self.lock(report.job_id).await;
        let mut state = self.store.get_job_state(&report.job_id).await?;
        if state.state.is_terminal() {
            debug!(state = %state.state, "Ignoring shard report for finished job");
            return Ok(state);
        }

        let expected = state.version;
        let previous = state.state;
        let shard = state.shard_mut(report.shard_index);
        if shard.active_execution(&report.node_id).is_none() {
            shard
                .begin_execution(report.node_id)
                .map_err(RequesterError::Validation)?;
        }

        let target = report.kind.target_state();
        let execution = shard
            .transition_execution(&report.node_id, target)
            .map_err(RequesterError::Validation)?;

        let mut published = None;
        match report.kind {
            ShardReportKind::BidRejected { reason } => execution.comment = Some(reason),
            ShardReportKind::Started => {}
            ShardReportKind::Completed {
                run_result,
                published: location,
            } => {
                execution.run_result = Some(run_result);
                execution.published_result = location.clone();
                published = location;
            }
            ShardReportKind::Failed { run_result, error } => {
                execution.run_result = run_result;
                execution.comment = Some(error);
            }
        }
        let shard_event = ShardStateChangedPayload {
            node_id: report.node_id,
            shard_index: report.shard_index,
            state: execution.state,
            run_result: execution.run_result.clone(),
            comment: execution.comment.clone(),
        };

        state.touch();
        if previous == JobStateType::Running && state.all_shards_terminal(shard_count) {
            if state.all_shards_completed(shard_count) {
                state
                    .transition(JobStateType::Completed, None)
                    .map_err(RequesterError::Validation)?;
            } else {
                let reason = first_failure(&state, shard_count);
                state
                    .transition(JobStateType::Error, Some(reason))
                    .map_err(RequesterError::Validation)?;
            }
        }

        self.store.update_job_state(&state, expected).await?;

        self.emit(report.job_id, ActorType::System, JobEventPayload::ShardStateChanged(shard_event))
            .await;
        if let Some(published_result) = published {
            self.emit(
                report.job_id,
                ActorType::System,
                JobEventPayload::ShardResultsPublished(ShardResultsPublishedPayload {
                    node_id: report.node_id,
                    shard_index: report.shard_index,
                    published_result,
                }),
            )
            .await;
        }
        if state.state != previous {
            info!(state = %state.state, "Job finished");
            self.emit_state_change(&state, previous, ActorType::System)
                .await;
        }

        Ok(state)
    }

    /// Persists `state` and announces the transition from `previous`.
    async fn commit(
        &self,
        state: &JobState,
        previous: JobStateType,
        expected: u64,
        actor: ActorType,
    ) -> Result<(), RequesterError> {
        self.store.update_job_state(state, expected).await?;
        self.emit_state_change(state, previous, actor).await;
        Ok(())
    }

    async fn emit_state_change(&self, state: &JobState, previous: JobStateType, actor: ActorType) {
        let payload = JobEventPayload::JobStateChanged(JobStateChangedPayload {
            previous,
            state: state.state,
            version: state.version,
            reason: state.reason.clone(),
            cancelled_by: state.cancelled_by,
        });
        self.emit(state.job_id, actor, payload).await;
    }

    pub(crate) async fn emit(&self, job_id: JobId, actor: ActorType, payload: JobEventPayload) {
        let event = EventEnvelope::builder()
            .job_id(job_id)
            .source_node(self.node_id)
            .event_type(payload.event_type())
            .actor(actor)
            .payload(payload)
            .build();
        let published = match event {
            Ok(event) => self.events.publish(event).await,
            Err(err) => Err(err),
        };
        if let Err(err) = published {
            warn!(job_id = %job_id, error = %err, "Failed to publish job event");
        }
    }
}

fn conflict(job_id: JobId, state: JobStateType, operation: &'static str) -> RequesterError {
    RequesterError::StateConflict {
        job_id,
        state,
        operation,
    }
}

/// Describes the lowest-indexed shard that did not complete.
fn first_failure(state: &JobState, shard_count: u32) -> String {
    (0..shard_count)
        .filter_map(|i| state.shards.get(&i))
        .filter_map(|shard| shard.executions.last())
        .find(|e| e.state != ShardStateType::Completed)
        .map(|e| match &e.comment {
            Some(comment) => format!("shard {} {}: {comment}", e.shard_index, e.state),
            None => format!("shard {} {}", e.shard_index, e.state),
        })
        .unwrap_or_else(|| "shard failed".to_string())
}
