//! Tasks that act on a single node's service and parameters

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kvplane_admin::ServiceState;
use kvplane_topology::{ComponentId, NodeId, NodeParams, Parameters, StorageNodeId, Topology};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{NextJob, Task};
use crate::cleanup::CleanupJob;
use crate::context::PlanContext;
use crate::error::{PlanError, PlanResult};
use crate::fault::FaultPoint;
use crate::health;
use crate::state::TaskState;

fn recorded(
    topology: &Topology,
    params: &Parameters,
    node: NodeId,
) -> PlanResult<(StorageNodeId, NodeParams)> {
    let sn = topology
        .node(node)
        .map(|n| n.storage_node())
        .ok_or_else(|| PlanError::not_found(node.into()))?;
    let node_params = params
        .node(node)
        .cloned()
        .ok_or_else(|| PlanError::inconsistent(format!("{node} has no parameters")))?;
    Ok((sn, node_params))
}

/// Disable a node and stop it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopNode {
    /// Node to stop
    pub node: NodeId,
    /// Stop even if the shard cannot elect a leader without it
    #[serde(default)]
    pub allow_override: bool,
}

#[async_trait]
impl Task for StopNode {
    fn name(&self) -> String {
        format!("StopNode({})", self.node)
    }

    fn lock_components(&self) -> Vec<ComponentId> {
        vec![self.node.into()]
    }

    fn cleanup_job(&self) -> Option<CleanupJob> {
        Some(CleanupJob::ReenableNode(self.node))
    }

    async fn execute(&self, ctx: &PlanContext) -> PlanResult<TaskState> {
        let topology = ctx.admin().current_topology().await?;
        let params = ctx.admin().current_parameters().await?;
        let (sn, mut node_params) = recorded(&topology, &params, self.node)?;

        if !node_params.disabled {
            health::ensure_safe_to_stop(ctx, &topology, self.node, self.allow_override).await?;
            node_params.disabled = true;
            ctx.fault(FaultPoint::BeforeSave, &self.name())?;
            ctx.admin().update_node_params(node_params).await?;
        }

        let agent = ctx.agent(sn).await?;
        let was_running = ctx.call(agent.stop_node(self.node, false)).await?;
        ctx.fault(FaultPoint::AfterStop, &self.name())?;
        if was_running {
            info!("Stopped {} on {}", self.node, sn);
        } else {
            debug!("{} was not running", self.node);
        }
        ctx.monitor().collect_now(self.node.into());
        Ok(TaskState::Succeeded)
    }
}

/// Enable a node and start it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartNode {
    /// Node to start
    pub node: NodeId,
}

#[async_trait]
impl Task for StartNode {
    fn name(&self) -> String {
        format!("StartNode({})", self.node)
    }

    fn lock_components(&self) -> Vec<ComponentId> {
        vec![self.node.into()]
    }

    async fn execute(&self, ctx: &PlanContext) -> PlanResult<TaskState> {
        let topology = ctx.admin().current_topology().await?;
        let params = ctx.admin().current_parameters().await?;
        let (sn, mut node_params) = recorded(&topology, &params, self.node)?;

        if node_params.disabled {
            node_params.disabled = false;
            ctx.fault(FaultPoint::BeforeSave, &self.name())?;
            ctx.admin().update_node_params(node_params.clone()).await?;
        }

        let agent = ctx.agent(sn).await?;
        ctx.call(agent.start_node(&node_params)).await?;
        info!("Started {} on {}", self.node, sn);
        ctx.monitor().collect_now(self.node.into());
        Ok(TaskState::Succeeded)
    }
}

/// Wait until a node reports a service state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitForNodeState {
    /// Node to watch
    pub node: NodeId,
    /// State to wait for; an unreachable node counts as stopped
    pub target: ServiceState,
    /// How long to wait
    pub timeout: Duration,
}

#[async_trait]
impl Task for WaitForNodeState {
    fn name(&self) -> String {
        format!("WaitForNodeState({} {})", self.node, self.target)
    }

    async fn execute(&self, ctx: &PlanContext) -> PlanResult<TaskState> {
        let started = Instant::now();
        loop {
            match self.step(ctx, started).await? {
                NextJob::Done(state) => return Ok(state),
                NextJob::RetryAfter(delay) => {
                    if !ctx.sleep(delay).await {
                        return Ok(TaskState::Interrupted);
                    }
                }
            }
        }
    }

    async fn step(&self, ctx: &PlanContext, started: Instant) -> PlanResult<NextJob> {
        let state = match ctx.node_admin(self.node).await {
            Ok(admin) => ctx.call(admin.ping()).await.map(|s| s.state),
            Err(e) => Err(e),
        };
        let reached = match &state {
            Ok(state) => *state == self.target,
            Err(_) => self.target == ServiceState::Stopped,
        };
        if reached {
            debug!("{} reached {}", self.node, self.target);
            return Ok(NextJob::Done(TaskState::Succeeded));
        }

        if started.elapsed() >= self.timeout {
            let last = match state {
                Ok(state) => state.to_string(),
                Err(e) => e.to_string(),
            };
            return Err(PlanError::remote(format!(
                "{} did not reach {} within {:?}, last seen {}",
                self.node, self.target, self.timeout, last
            )));
        }
        Ok(NextJob::RetryAfter(ctx.config().executor.continuation_delay))
    }
}

/// Merge entries into a node's parameters and push them out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateNodeParams {
    /// Node to update
    pub node: NodeId,
    /// Entries to set
    pub changes: BTreeMap<String, String>,
}

#[async_trait]
impl Task for UpdateNodeParams {
    fn name(&self) -> String {
        format!("UpdateNodeParams({})", self.node)
    }

    fn lock_components(&self) -> Vec<ComponentId> {
        vec![self.node.into()]
    }

    async fn execute(&self, ctx: &PlanContext) -> PlanResult<TaskState> {
        let topology = ctx.admin().current_topology().await?;
        let params = ctx.admin().current_parameters().await?;
        let (sn, mut node_params) = recorded(&topology, &params, self.node)?;

        if !node_params.contains_all(&self.changes) {
            node_params
                .extra
                .extend(self.changes.iter().map(|(k, v)| (k.clone(), v.clone())));
            ctx.fault(FaultPoint::BeforeSave, &self.name())?;
            ctx.admin().update_node_params(node_params.clone()).await?;
            info!("Updated {} parameters of {}", self.changes.len(), self.node);
        }

        let agent = ctx.agent(sn).await?;
        ctx.call(agent.new_node_parameters(&node_params)).await?;

        match ctx.node_admin(self.node).await {
            Ok(admin) => {
                if let Err(e) = ctx.call(admin.new_parameters(&node_params)).await {
                    warn!("{} will pick up new parameters on restart: {}", self.node, e);
                }
            }
            Err(e) => warn!("{} will pick up new parameters on restart: {}", self.node, e),
        }
        Ok(TaskState::Succeeded)
    }
}
