use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bidmesh_id::JobId;
use bidmesh_model::Job;

use crate::dispatch::{DispatchError, ShardDispatcher};

/// Dispatcher that remembers what it was asked to do.
#[derive(Default)]
pub(crate) struct RecordingDispatcher {
    dispatched: Mutex<Vec<JobId>>,
    cancelled: Mutex<Vec<JobId>>,
    fail: AtomicBool,
}

impl RecordingDispatcher {
    pub(crate) fn fail_dispatch(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn dispatched(&self) -> Vec<JobId> {
        self.dispatched.lock().unwrap().clone()
    }

    pub(crate) fn cancelled(&self) -> Vec<JobId> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl ShardDispatcher for RecordingDispatcher {
    async fn dispatch(&self, job: &Job) -> Result<(), DispatchError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DispatchError("no compute nodes".into()));
        }
        self.dispatched.lock().unwrap().push(*job.id());
        Ok(())
    }

    async fn cancel(&self, job_id: &JobId, _reason: &str) -> Result<(), DispatchError> {
        self.cancelled.lock().unwrap().push(*job_id);
        Ok(())
    }
}
