//! Tasks: single, idempotent units of plan work
//!
//! Every task may run more than once for the same logical change, for example
//! when an interrupted plan is executed again. Before mutating anything a task
//! inspects the current topology or metadata and treats an already applied
//! change as success.

mod broadcast;
mod metadata;
mod node;
mod topology;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use kvplane_topology::{ComponentId, Topology};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::broadcast::broadcast_topology;
use crate::cleanup::CleanupJob;
use crate::context::PlanContext;
use crate::error::PlanResult;
use crate::fault::FaultPoint;
use crate::state::TaskState;

pub use broadcast::{BroadcastMetadata, BroadcastTopology};
pub use metadata::{AddUser, AlterTable, CreateTable, DropTable, RemoveUser};
pub use node::{StartNode, StopNode, UpdateNodeParams, WaitForNodeState};
pub use topology::{
    AddNode, AddShard, AddStorageNode, AssignPartitions, ChangeNodeAddress, RelocateNode,
    RemoveNode,
};

/// What a job step asks of the worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextJob {
    /// The task finished in this state
    Done(TaskState),
    /// Not done yet; run another step after the delay
    RetryAfter(Duration),
}

/// A unit of plan work
#[async_trait]
pub trait Task: Send + Sync {
    /// Name used in logs and reports
    fn name(&self) -> String;

    /// Components this task reserves while its plan runs
    fn lock_components(&self) -> Vec<ComponentId> {
        Vec::new()
    }

    /// Repair procedure to run if the task fails or is interrupted
    fn cleanup_job(&self) -> Option<CleanupJob> {
        None
    }

    /// Whether a failure is logged and skipped instead of ending the plan
    fn continue_past_error(&self) -> bool {
        false
    }

    /// Run the task to completion
    async fn execute(&self, ctx: &PlanContext) -> PlanResult<TaskState>;

    /// Run one step on the worker pool.
    ///
    /// `started` is when the first step ran. Tasks that wait on remote state
    /// return [`NextJob::RetryAfter`] instead of holding a pool slot.
    async fn step(&self, ctx: &PlanContext, started: Instant) -> PlanResult<NextJob> {
        let _ = started;
        self.execute(ctx).await.map(NextJob::Done)
    }
}

/// Every task a plan can hold, with its immutable parameters.
///
/// Two instances are logically equal when they would produce the same effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    /// Add a storage node
    AddStorageNode(AddStorageNode),
    /// Add a replication group
    AddShard(AddShard),
    /// Assign partitions to a shard
    AssignPartitions(AssignPartitions),
    /// Add a node to a shard
    AddNode(AddNode),
    /// Remove a node from its shard
    RemoveNode(RemoveNode),
    /// Move a node to another storage node
    RelocateNode(RelocateNode),
    /// Change a node's replication address
    ChangeNodeAddress(ChangeNodeAddress),
    /// Disable and stop a node
    StopNode(StopNode),
    /// Enable and start a node
    StartNode(StartNode),
    /// Wait for a node to reach a service state
    WaitForNodeState(WaitForNodeState),
    /// Merge node parameters
    UpdateNodeParams(UpdateNodeParams),
    /// Broadcast the current topology
    BroadcastTopology(BroadcastTopology),
    /// Broadcast the current metadata of a kind
    BroadcastMetadata(BroadcastMetadata),
    /// Create a table
    CreateTable(CreateTable),
    /// Replace a table definition
    AlterTable(AlterTable),
    /// Drop a table
    DropTable(DropTable),
    /// Add a user
    AddUser(AddUser),
    /// Remove a user
    RemoveUser(RemoveUser),
}

impl TaskKind {
    fn inner(&self) -> &dyn Task {
        match self {
            TaskKind::AddStorageNode(t) => t,
            TaskKind::AddShard(t) => t,
            TaskKind::AssignPartitions(t) => t,
            TaskKind::AddNode(t) => t,
            TaskKind::RemoveNode(t) => t,
            TaskKind::RelocateNode(t) => t,
            TaskKind::ChangeNodeAddress(t) => t,
            TaskKind::StopNode(t) => t,
            TaskKind::StartNode(t) => t,
            TaskKind::WaitForNodeState(t) => t,
            TaskKind::UpdateNodeParams(t) => t,
            TaskKind::BroadcastTopology(t) => t,
            TaskKind::BroadcastMetadata(t) => t,
            TaskKind::CreateTable(t) => t,
            TaskKind::AlterTable(t) => t,
            TaskKind::DropTable(t) => t,
            TaskKind::AddUser(t) => t,
            TaskKind::RemoveUser(t) => t,
        }
    }

    /// Whether both tasks would produce the same effect
    pub fn logical_eq(&self, other: &TaskKind) -> bool {
        self == other
    }
}

#[async_trait]
impl Task for TaskKind {
    fn name(&self) -> String {
        self.inner().name()
    }

    fn lock_components(&self) -> Vec<ComponentId> {
        self.inner().lock_components()
    }

    fn cleanup_job(&self) -> Option<CleanupJob> {
        self.inner().cleanup_job()
    }

    fn continue_past_error(&self) -> bool {
        self.inner().continue_past_error()
    }

    async fn execute(&self, ctx: &PlanContext) -> PlanResult<TaskState> {
        self.inner().execute(ctx).await
    }

    async fn step(&self, ctx: &PlanContext, started: Instant) -> PlanResult<NextJob> {
        self.inner().step(ctx, started).await
    }
}

/// A task as placed in a plan, with its error policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedTask {
    /// The task
    pub kind: TaskKind,
    /// Log and skip a failure instead of ending the plan
    #[serde(default)]
    pub continue_past_error: bool,
}

impl PlannedTask {
    /// A task that ends the plan when it fails
    pub fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            continue_past_error: false,
        }
    }

    /// A task whose failure is logged and skipped
    pub fn lenient(kind: TaskKind) -> Self {
        Self {
            kind,
            continue_past_error: true,
        }
    }
}

impl From<TaskKind> for PlannedTask {
    fn from(kind: TaskKind) -> Self {
        Self::new(kind)
    }
}

#[async_trait]
impl Task for PlannedTask {
    fn name(&self) -> String {
        self.kind.name()
    }

    fn lock_components(&self) -> Vec<ComponentId> {
        self.kind.lock_components()
    }

    fn cleanup_job(&self) -> Option<CleanupJob> {
        self.kind.cleanup_job()
    }

    fn continue_past_error(&self) -> bool {
        self.continue_past_error || self.kind.continue_past_error()
    }

    async fn execute(&self, ctx: &PlanContext) -> PlanResult<TaskState> {
        self.kind.execute(ctx).await
    }

    async fn step(&self, ctx: &PlanContext, started: Instant) -> PlanResult<NextJob> {
        self.kind.step(ctx, started).await
    }
}

/// Map a broadcast result onto a task state
fn broadcast_state(completed: bool) -> TaskState {
    if completed {
        TaskState::Succeeded
    } else {
        TaskState::Interrupted
    }
}

/// Persist a topology and ship it to the data nodes
async fn save_and_broadcast(
    ctx: &PlanContext,
    task: &str,
    topology: &Topology,
) -> PlanResult<TaskState> {
    ctx.fault(FaultPoint::BeforeSave, task)?;
    ctx.admin().save_topology(topology).await?;
    ctx.fault(FaultPoint::AfterSave, task)?;
    broadcast_saved(ctx, task, topology).await
}

/// Ship an already persisted topology to the data nodes
async fn broadcast_saved(
    ctx: &PlanContext,
    task: &str,
    topology: &Topology,
) -> PlanResult<TaskState> {
    ctx.fault(FaultPoint::BeforeBroadcast, task)?;
    debug!("{} broadcasting topology {}", task, topology.sequence_number());
    Ok(broadcast_state(broadcast_topology(ctx, topology).await?))
}
