//! # bidmesh-events
//!
//! Lifecycle events emitted by the scheduler for downstream consumers (API
//! layer, event broadcaster, job waiters).
//!
//! - Events are immutable records of state transitions that already happened
//! - Every event belongs to exactly one job
//! - Events are emitted through an [`EventSink`] handed to each component at
//!   construction, never through a process-wide handle
//!
//! ## Event Types
//!
//! - `job.created`
//! - `job.state_changed`
//! - `shard.state_changed`
//! - `shard.results_published`

mod envelope;
mod error;
mod sink;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use sink::{ChannelSink, EventSink};
pub use types::*;
