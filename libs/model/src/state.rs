//! Mutable lifecycle records for jobs and shards.

use std::collections::BTreeMap;
use std::fmt;

use bidmesh_id::{JobId, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::result::RunResult;
use crate::spec::StorageSpec;

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStateType {
    Created,
    Queued,
    Bidding,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl JobStateType {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStateType::Completed | JobStateType::Error | JobStateType::Cancelled
        )
    }

    pub fn can_transition_to(&self, to: JobStateType) -> bool {
        use JobStateType::*;
        matches!(
            (self, to),
            (Created, Queued | Cancelled)
                | (Queued, Bidding | Running | Cancelled)
                | (Bidding, Running | Cancelled)
                | (Running, Completed | Error | Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStateType::Created => "created",
            JobStateType::Queued => "queued",
            JobStateType::Bidding => "bidding",
            JobStateType::Running => "running",
            JobStateType::Completed => "completed",
            JobStateType::Error => "error",
            JobStateType::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who asked for a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelSource {
    User,
    System,
}

/// Lifecycle of one shard execution on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStateType {
    /// Dispatched, waiting on the node's bid decision.
    Bidding,
    Running,
    Completed,
    Error,
    /// The node declined the shard.
    BidRejected,
    Cancelled,
}

impl ShardStateType {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ShardStateType::Bidding | ShardStateType::Running)
    }

    pub fn can_transition_to(&self, to: ShardStateType) -> bool {
        use ShardStateType::*;
        matches!(
            (self, to),
            (Bidding, Running | BidRejected | Error | Cancelled)
                | (Running, Completed | Error | Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShardStateType::Bidding => "bidding",
            ShardStateType::Running => "running",
            ShardStateType::Completed => "completed",
            ShardStateType::Error => "error",
            ShardStateType::BidRejected => "bid_rejected",
            ShardStateType::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ShardStateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt at running a shard, keyed by `(node, shard index)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub node_id: NodeId,
    pub shard_index: u32,
    pub state: ShardStateType,
    pub version: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_result: Option<RunResult>,

    /// Where the shard's results were published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_result: Option<StorageSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

/// All execution attempts of one shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ShardState {
    pub shard_index: u32,
    pub executions: Vec<ExecutionState>,
}

impl ShardState {
    /// The non-terminal execution on `node`, if any.
    pub fn active_execution(&self, node: &NodeId) -> Option<&ExecutionState> {
        self.executions
            .iter()
            .find(|e| &e.node_id == node && !e.state.is_terminal())
    }

    /// State of the most recent execution.
    pub fn latest_state(&self) -> Option<ShardStateType> {
        self.executions.last().map(|e| e.state)
    }

    pub fn is_terminal(&self) -> bool {
        self.latest_state().is_some_and(|s| s.is_terminal())
    }

    /// Opens a new execution on `node`.
    ///
    /// Fails if that node already has an active execution of this shard.
    pub fn begin_execution(&mut self, node: NodeId) -> Result<&mut ExecutionState, ModelError> {
        if let Some(active) = self.active_execution(&node) {
            return Err(ModelError::InvalidTransition {
                from: active.state.to_string(),
                to: ShardStateType::Bidding.to_string(),
            });
        }
        let now = Utc::now();
        self.executions.push(ExecutionState {
            node_id: node,
            shard_index: self.shard_index,
            state: ShardStateType::Bidding,
            version: 1,
            run_result: None,
            published_result: None,
            comment: None,
            create_time: now,
            update_time: now,
        });
        let last = self.executions.len() - 1;
        Ok(&mut self.executions[last])
    }

    /// Moves the active execution on `node` to `to`.
    pub fn transition_execution(
        &mut self,
        node: &NodeId,
        to: ShardStateType,
    ) -> Result<&mut ExecutionState, ModelError> {
        let execution = self
            .executions
            .iter_mut()
            .rev()
            .find(|e| &e.node_id == node)
            .ok_or_else(|| ModelError::InvalidTransition {
                from: "none".into(),
                to: to.to_string(),
            })?;

        if !execution.state.can_transition_to(to) {
            return Err(ModelError::InvalidTransition {
                from: execution.state.to_string(),
                to: to.to_string(),
            });
        }
        execution.state = to;
        execution.version += 1;
        execution.update_time = Utc::now();
        Ok(execution)
    }
}

/// The mutable record of a job, owned by the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: JobId,
    pub state: JobStateType,

    /// Incremented on every update; used for optimistic concurrency.
    pub version: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_by: Option<CancelSource>,

    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,

    #[serde(default)]
    pub shards: BTreeMap<u32, ShardState>,
}

impl JobState {
    /// A fresh record in `Created`.
    pub fn new(job_id: JobId) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            state: JobStateType::Created,
            version: 1,
            reason: None,
            cancelled_by: None,
            create_time: now,
            update_time: now,
            shards: BTreeMap::new(),
        }
    }

    /// Applies a lifecycle transition, bumping the version.
    pub fn transition(
        &mut self,
        to: JobStateType,
        reason: Option<String>,
    ) -> Result<(), ModelError> {
        if !self.state.can_transition_to(to) {
            return Err(ModelError::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        self.reason = reason;
        self.touch();
        Ok(())
    }

    /// Bumps the version without changing the lifecycle state.
    pub fn touch(&mut self) {
        self.version += 1;
        self.update_time = Utc::now();
    }

    pub fn shard_mut(&mut self, index: u32) -> &mut ShardState {
        self.shards.entry(index).or_insert_with(|| ShardState {
            shard_index: index,
            executions: Vec::new(),
        })
    }

    /// True once shards `0..shard_count` have all reached a terminal state.
    pub fn all_shards_terminal(&self, shard_count: u32) -> bool {
        (0..shard_count).all(|i| self.shards.get(&i).is_some_and(ShardState::is_terminal))
    }

    /// True if every shard's latest execution completed.
    pub fn all_shards_completed(&self, shard_count: u32) -> bool {
        (0..shard_count).all(|i| {
            self.shards.get(&i).and_then(ShardState::latest_state)
                == Some(ShardStateType::Completed)
        })
    }
}
