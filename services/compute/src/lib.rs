//! # bidmesh-compute
//!
//! The compute side of bidmesh: decides whether to take a shard, runs it
//! in a container and reports the outcome.
//!
//! - [`ShardExecutor`]: one container per shard, with result capture and
//!   guaranteed teardown
//! - [`ComputeNode`]: bid, reserve, run, publish, report
//! - [`ContainerRuntime`]: Docker Engine API client and an in-memory mock
//! - [`CapacityTracker`]: resources reserved by running shards
//! - [`CleanupManager`]: shutdown sweeps

pub mod capacity;
pub mod cleanup;
pub mod config;
pub mod executor;
pub mod node;
pub mod runtime;

pub use capacity::{CapacityTracker, SystemResources};
pub use cleanup::CleanupManager;
pub use config::ComputeConfig;
pub use executor::{ExecutorError, ShardExecutor, EXECUTOR_LABEL, JOB_LABEL, JOB_SPEC_ENV};
pub use node::{ComputeNode, ShardReporter, RESULTS_VOLUME};
pub use runtime::{ContainerRuntime, DockerRuntime, MockRuntime, RuntimeError};
