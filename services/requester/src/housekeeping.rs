//! Housekeeping background worker.
//!
//! Periodically cancels jobs that have been in flight longer than their
//! execution timeout.

use std::sync::Arc;
use std::time::Duration;

use bidmesh_model::JobStateType;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::error::RequesterError;
use crate::jobstore::JobQuery;
use crate::queue::{CancelJobRequest, SchedulingQueue};

/// Worker that expires overdue jobs.
pub struct HousekeepingWorker {
    queue: Arc<SchedulingQueue>,
    interval: Duration,
    default_timeout: Duration,
}

impl HousekeepingWorker {
    /// `default_timeout` applies to jobs stored without one.
    pub fn new(queue: Arc<SchedulingQueue>, interval: Duration, default_timeout: Duration) -> Self {
        Self {
            queue,
            interval,
            default_timeout,
        }
    }

    /// Run the housekeeping worker until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting housekeeping worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        // Don't immediately tick on startup - wait for first interval
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep(Utc::now()).await {
                        error!(error = %e, "Housekeeping sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Housekeeping worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Cancels every `Bidding` or `Running` job created more than its
    /// timeout before `now`. Returns how many were cancelled.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, RequesterError> {
        let query = JobQuery::in_states([JobStateType::Bidding, JobStateType::Running]);
        let jobs = self.queue.store().list_jobs(&query).await?;

        let mut expired = 0;
        for (job, _) in jobs {
            let timeout = job.spec.execution_timeout().unwrap_or(self.default_timeout);
            let Ok(timeout) = chrono::Duration::from_std(timeout) else {
                continue;
            };
            if job.metadata.created_at + timeout > now {
                continue;
            }

            let reason = format!("job timed out after {}s", timeout.num_seconds());
            match self
                .queue
                .cancel_job(CancelJobRequest::by_system(*job.id(), reason))
                .await
            {
                Ok(result) if !result.already_cancelled => expired += 1,
                Ok(_) => {}
                // Finished between the listing and the cancel.
                Err(e) if e.is_state_conflict() => {}
                Err(e) => warn!(job_id = %job.id(), error = %e, "Failed to expire job"),
            }
        }

        if expired > 0 {
            info!(expired, "Housekeeping cancelled overdue jobs");
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobstore::InMemoryJobStore;
    use crate::testutil::RecordingDispatcher;
    use bidmesh_events::ChannelSink;
    use bidmesh_id::NodeId;
    use bidmesh_model::{CancelSource, DockerSpec, Job, Spec};

    fn queue() -> Arc<SchedulingQueue> {
        Arc::new(SchedulingQueue::new(
            NodeId::new(),
            Arc::new(InMemoryJobStore::new()),
            Arc::new(RecordingDispatcher::default()),
            Arc::new(ChannelSink::default()),
        ))
    }

    async fn running_job(queue: &SchedulingQueue, timeout_secs: u64) -> Job {
        let spec = Spec {
            docker: DockerSpec {
                image: "ubuntu".into(),
                ..Default::default()
            },
            timeout_secs: Some(timeout_secs),
            ..Default::default()
        };
        let job = Job::new("client", spec);
        queue.store().create_job(&job).await.unwrap();
        queue.enqueue_job(job.id()).await.unwrap();
        queue.start_job(job.id()).await.unwrap();
        job
    }

    #[tokio::test]
    async fn test_sweep_cancels_only_overdue_jobs() {
        let queue = queue();
        let short = running_job(&queue, 60).await;
        let long = running_job(&queue, 3600).await;
        let worker = HousekeepingWorker::new(
            queue.clone(),
            Duration::from_secs(30),
            Duration::from_secs(1800),
        );

        let later = Utc::now() + chrono::Duration::minutes(5);
        assert_eq!(worker.sweep(later).await.unwrap(), 1);

        let state = queue.store().get_job_state(short.id()).await.unwrap();
        assert_eq!(state.state, JobStateType::Cancelled);
        assert_eq!(state.cancelled_by, Some(CancelSource::System));
        let state = queue.store().get_job_state(long.id()).await.unwrap();
        assert_eq!(state.state, JobStateType::Running);

        assert_eq!(worker.sweep(later).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_worker_stops_on_shutdown() {
        let worker = HousekeepingWorker::new(
            queue(),
            Duration::from_millis(10),
            Duration::from_secs(1800),
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
