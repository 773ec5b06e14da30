//! Typed ID definitions.

use crate::define_id;

define_id!(
    /// Identifies a submitted job. Generated by the requester at submission.
    JobId,
    "job"
);

define_id!(
    /// Identifies a node, in either the requester or the compute role.
    NodeId,
    "node"
);

define_id!(
    /// Identifies a single emitted job/shard event.
    EventId,
    "evt"
);
