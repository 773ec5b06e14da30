//! Waiting for jobs to finish.

use std::sync::Arc;
use std::time::Duration;

use bidmesh_id::JobId;
use bidmesh_model::{JobState, JobStateType};
use bidmesh_reconcile::{StallError, StallMonitor};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::jobstore::{JobStore, StoreError};

/// Waits for a job to reach a terminal state.
///
/// The job must show progress in every stall window: either its state
/// version advanced or it is `Running`. A job stuck in `Bidding` past the
/// window fails the wait.
pub struct JobWaiter {
    store: Arc<dyn JobStore>,
    monitor: StallMonitor,
    poll_interval: Duration,
}

impl JobWaiter {
    pub fn new(store: Arc<dyn JobStore>, stall_window: Duration) -> Self {
        Self {
            store,
            monitor: StallMonitor::new(stall_window),
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub async fn wait(&self, job_id: &JobId) -> Result<JobState, StallError<StoreError>> {
        let store = &self.store;
        let check = |last_version: u64| async move {
            let state = store.get_job_state(job_id).await?;
            let alive = state.version > last_version || state.state == JobStateType::Running;
            Ok::<_, StoreError>((state.version, alive))
        };
        let work = |cancel: CancellationToken| {
            poll_until_terminal(store.as_ref(), job_id, self.poll_interval, cancel)
        };

        self.monitor.run(0, check, work).await
    }
}

async fn poll_until_terminal(
    store: &dyn JobStore,
    job_id: &JobId,
    poll_interval: Duration,
    cancel: CancellationToken,
) -> Result<JobState, StoreError> {
    loop {
        let state = store.get_job_state(job_id).await?;
        if state.state.is_terminal() {
            debug!(job_id = %job_id, state = %state.state, "Job finished");
            return Ok(state);
        }
        tokio::select! {
            _ = cancel.cancelled() => return Ok(state),
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}
