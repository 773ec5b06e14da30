//! Requester node for bidmesh.
//!
//! Accepts job submissions, runs them through the transform pipeline,
//! persists them, solicits a bid decision and drives each job through its
//! lifecycle as compute nodes report shard progress.

pub mod config;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod housekeeping;
pub mod jobstore;
pub mod queue;
pub mod transform;
pub mod waiter;

#[cfg(test)]
mod testutil;

pub use config::RequesterConfig;
pub use dispatch::{DispatchError, ShardDispatcher};
pub use endpoint::{ApproveJobRequest, RequesterEndpoint};
pub use error::{RequesterError, SubmitJobError};
pub use housekeeping::HousekeepingWorker;
pub use jobstore::{InMemoryJobStore, JobQuery, JobStore, SqliteJobStore, StoreError};
pub use queue::{CancelJobRequest, CancelJobResult, SchedulingQueue};
pub use transform::{TransformError, TransformPipeline, Transformer};
pub use waiter::JobWaiter;
