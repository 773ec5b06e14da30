use bidmesh_id::{JobId, NodeId};
use serde::{Deserialize, Serialize};

use crate::result::RunResult;
use crate::spec::StorageSpec;
use crate::state::ShardStateType;

/// A compute node's account of one shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardReport {
    pub job_id: JobId,
    pub node_id: NodeId,
    pub shard_index: u32,
    pub kind: ShardReportKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShardReportKind {
    /// The node declined to run the shard.
    BidRejected { reason: String },

    /// The node accepted the shard and started executing it.
    Started,

    /// The container exited zero and results were captured.
    Completed {
        run_result: RunResult,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        published: Option<StorageSpec>,
    },

    /// Setup or execution failed.
    Failed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_result: Option<RunResult>,
        error: String,
    },
}

impl ShardReportKind {
    /// Shard state this report moves the execution to.
    pub fn target_state(&self) -> ShardStateType {
        match self {
            ShardReportKind::BidRejected { .. } => ShardStateType::BidRejected,
            ShardReportKind::Started => ShardStateType::Running,
            ShardReportKind::Completed { .. } => ShardStateType::Completed,
            ShardReportKind::Failed { .. } => ShardStateType::Error,
        }
    }
}
