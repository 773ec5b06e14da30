//! # bidmesh-model
//!
//! Shared data model for the bidmesh scheduler.
//!
//! - [`Job`]: identity plus an immutable [`Spec`], owned by the job store
//!   once created
//! - [`JobShard`]: one `(job, index)` unit of execution
//! - [`JobState`] / [`ShardState`]: the mutable lifecycle records
//! - [`RunResult`]: what one shard execution attempt produced
//! - [`ShardReport`]: what a compute node tells the requester about a shard
//!
//! ## Lifecycle
//!
//! ```text
//! Created -> Queued -> Bidding -> Running -> Completed
//!    |          |         |          |----> Error
//!    +----------+---------+----------+----> Cancelled
//! ```
//!
//! Terminal states accept no further transitions.

mod error;
mod job;
mod report;
mod resources;
mod result;
mod spec;
mod state;

pub use error::ModelError;
pub use job::{Job, JobCreatePayload, JobShard, Metadata, RequesterInfo, API_VERSION};
pub use report::{ShardReport, ShardReportKind};
pub use resources::ResourceUsage;
pub use result::{RunResult, EXIT_CODE_FILE, STDERR_FILE, STDOUT_FILE};
pub use spec::{
    Deal, DockerSpec, Engine, Network, OutputSpec, ResourceSpec, ShardingConfig, Spec,
    StorageSource, StorageSourceType, StorageSpec,
};
pub use state::{
    CancelSource, ExecutionState, JobState, JobStateType, ShardState, ShardStateType,
};
