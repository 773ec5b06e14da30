//! # bidmesh-id
//!
//! Typed identifiers for the bidmesh job scheduler.
//!
//! Every identifier is a prefixed ULID: `{prefix}_{ulid}`.
//!
//! - `job_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `node_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `evt_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! Job IDs are generated once, at submission, and are never reused. ULIDs
//! carry 80 bits of randomness per millisecond, and the typed wrappers stop
//! a node ID from being passed where a job ID is expected.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
