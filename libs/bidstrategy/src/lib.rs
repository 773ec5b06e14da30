//! # bidmesh-bidstrategy
//!
//! Decides whether a node bids on a job.
//!
//! A decision is tri-state ([`BidStrategyResponse`]): bid, wait, or reject
//! with a reason. Strategies never answer "bid" and "wait" at once; the
//! response type makes that unrepresentable.
//!
//! Strategies:
//! - [`FixedStrategy`]: a constant answer
//! - [`JobSelectionStrategy`]: locality, statefulness and network policy
//! - [`ResourceCapacityStrategy`]: per-job and remaining-capacity limits
//! - [`HttpProbeStrategy`] / [`ExecProbeStrategy`]: external probes
//! - [`ChainedStrategy`]: combines several of the above

mod capacity;
mod chained;
mod error;
mod fixed;
mod policy;
mod probe;
mod types;

pub use capacity::{CapacitySource, ResourceCapacityStrategy};
pub use chained::ChainedStrategy;
pub use error::BidStrategyError;
pub use fixed::FixedStrategy;
pub use policy::{InputLocality, JobSelectionPolicy, JobSelectionStrategy, Locality};
pub use probe::{ExecProbeStrategy, HttpProbeStrategy, PROBE_DATA_ENV};
pub use types::{BidStrategy, BidStrategyRequest, BidStrategyResponse, ProbeData};
