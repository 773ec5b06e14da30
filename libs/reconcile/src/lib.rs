//! Bounded waiting primitives.
//!
//! A [`StallMonitor`] runs a unit of work while periodically asking a check
//! function whether the work is still making progress. Key concepts:
//!
//! - **Progress value**: whatever the check compares between ticks (a
//!   state version, a directory size, a peer count).
//! - **Stall**: a tick where the check reports no progress. The work is
//!   cancelled and the monitor fails with [`StallError::Timeout`].
//!
//! # Invariants
//!
//! - Exactly one of result or error is produced
//! - The work's cancellation token is cancelled on every exit path

mod stall;

pub use stall::{StallError, StallMonitor, DEFAULT_STALL_INTERVAL};
