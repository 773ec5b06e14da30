//! Single-process bidmesh node.
//!
//! Runs a requester and a compute node side by side. The requester
//! dispatches shards to the compute node on background tasks and shard
//! reports come back over a channel, so neither side calls into the other
//! while holding its own locks.

pub mod config;
pub mod local;
pub mod node;

pub use config::{NodeConfig, RuntimeBackend, StoreBackend};
pub use local::{forward_reports, ChannelReporter, LocalDispatcher};
pub use node::{connect_runtime, open_store, Node};
