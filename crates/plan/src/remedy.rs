//! Topology repair
//!
//! A node's recorded state lives in three places: the topology and parameters
//! in the admin store, the address its replication group holds for it, and the
//! configuration on its storage node agent. A remedy is the single action that
//! moves these towards each other. Remedies only converge forward; a prior
//! topology is never restored.

use kvplane_admin::ServiceState;
use kvplane_topology::{NodeId, StorageNodeId, params::host_of};
use tracing::{info, warn};

use crate::broadcast::broadcast_topology;
use crate::context::PlanContext;
use crate::error::{PlanError, PlanResult};
use crate::membership::{LiveAddress, member_address};

/// A corrective action for one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Remedy {
    /// Nothing to fix
    NoFix,
    /// Clear the disabled flag and start the node
    ReenableNode(NodeId),
    /// The group places the node on another storage node; move the records
    CorrectLocation {
        /// Node to move
        node: NodeId,
        /// Storage node the topology records
        from: StorageNodeId,
        /// Storage node the group reports
        to: StorageNodeId,
        /// Address the group holds
        ha_host_port: String,
    },
    /// The group has no leader to ask; try again later
    WaitAndRetry(NodeId),
    /// The recorded agent has no configuration for the node; create it
    NeedsDeploy {
        /// Node to deploy
        node: NodeId,
        /// Agent to deploy on
        storage_node: StorageNodeId,
    },
}

/// Compare the recorded and live state of `node` and pick a remedy
pub async fn diagnose(ctx: &PlanContext, node: NodeId) -> PlanResult<Remedy> {
    let topology = ctx.admin().current_topology().await?;
    let params = ctx.admin().current_parameters().await?;

    let Some(recorded) = topology.node(node) else {
        return Ok(Remedy::NoFix);
    };
    let recorded_sn = recorded.storage_node();

    match member_address(ctx, &topology, node).await {
        LiveAddress::NoLeader => return Ok(Remedy::WaitAndRetry(node)),
        LiveAddress::Known(host_port) => {
            let live_sn = params
                .storage_node_by_host(host_of(&host_port))
                .map(|sn| sn.id);
            if let Some(live_sn) = live_sn.filter(|sn| *sn != recorded_sn) {
                return Ok(Remedy::CorrectLocation {
                    node,
                    from: recorded_sn,
                    to: live_sn,
                    ha_host_port: host_port,
                });
            }
        }
        LiveAddress::NotMember | LiveAddress::Unknown => {}
    }

    let agent = ctx.agent(recorded_sn).await?;
    if ctx.call(agent.node_config(node)).await?.is_none() {
        return Ok(Remedy::NeedsDeploy {
            node,
            storage_node: recorded_sn,
        });
    }

    let Some(node_params) = params.node(node) else {
        return Ok(Remedy::NoFix);
    };
    if node_params.disabled || !is_running(ctx, node).await {
        return Ok(Remedy::ReenableNode(node));
    }

    Ok(Remedy::NoFix)
}

/// Whether the node answers as running
async fn is_running(ctx: &PlanContext, node: NodeId) -> bool {
    let Ok(admin) = ctx.node_admin(node).await else {
        return false;
    };
    ctx.call(admin.ping())
        .await
        .is_ok_and(|status| status.state == ServiceState::Running)
}

/// Carry out a remedy.
///
/// Returns `false` when the remedy must be diagnosed again later.
pub async fn apply(ctx: &PlanContext, remedy: &Remedy) -> PlanResult<bool> {
    match remedy {
        Remedy::NoFix => Ok(true),
        Remedy::WaitAndRetry(node) => {
            info!("{} group has no leader, repair deferred", node);
            Ok(false)
        }
        Remedy::ReenableNode(node) => reenable(ctx, *node).await,
        Remedy::NeedsDeploy { node, storage_node } => {
            let params = ctx.admin().current_parameters().await?;
            let node_params = params
                .node(*node)
                .cloned()
                .ok_or_else(|| PlanError::inconsistent(format!("{node} has no parameters")))?;
            let agent = ctx.agent(*storage_node).await?;
            ctx.call(agent.start_node(&node_params)).await?;
            info!("Deployed {} on {}", node, storage_node);
            ctx.monitor().collect_now((*node).into());
            Ok(true)
        }
        Remedy::CorrectLocation {
            node,
            from,
            to,
            ha_host_port,
        } => correct_location(ctx, *node, *from, *to, ha_host_port).await,
    }
}

/// Clear the disabled flag of `node` and start it
pub async fn reenable(ctx: &PlanContext, node: NodeId) -> PlanResult<bool> {
    let topology = ctx.admin().current_topology().await?;
    let Some(recorded) = topology.node(node) else {
        return Ok(true);
    };
    let params = ctx.admin().current_parameters().await?;
    let mut node_params = params
        .node(node)
        .cloned()
        .ok_or_else(|| PlanError::inconsistent(format!("{node} has no parameters")))?;
    if node_params.disabled {
        node_params.disabled = false;
        ctx.admin().update_node_params(node_params.clone()).await?;
    }
    let agent = ctx.agent(recorded.storage_node()).await?;
    ctx.call(agent.start_node(&node_params)).await?;
    info!("Re-enabled {}", node);
    ctx.monitor().collect_now(node.into());
    Ok(true)
}

async fn correct_location(
    ctx: &PlanContext,
    node: NodeId,
    from: StorageNodeId,
    to: StorageNodeId,
    ha_host_port: &str,
) -> PlanResult<bool> {
    let mut topology = ctx.admin().current_topology().await?;
    let params = ctx.admin().current_parameters().await?;
    let mut moved = topology
        .node(node)
        .cloned()
        .ok_or_else(|| PlanError::not_found(node.into()))?;
    let mut node_params = params
        .node(node)
        .cloned()
        .ok_or_else(|| PlanError::inconsistent(format!("{node} has no parameters")))?;

    info!("Correcting location of {} from {} to {}", node, from, to);
    if moved.storage_node() != to {
        moved.set_storage_node(to);
        topology.update_node(moved)?;
    }
    node_params.storage_node = to;
    node_params.ha_host_port = ha_host_port.to_string();
    ctx.admin()
        .save_topology_with_params(&topology, &[node_params.clone()])
        .await?;

    if !broadcast_topology(ctx, &topology).await? {
        return Ok(false);
    }

    let agent = ctx.agent(to).await?;
    ctx.call(agent.start_node(&node_params)).await?;

    match ctx.agent(from).await {
        Ok(old) => {
            if let Err(e) = ctx.call(old.destroy_node(node)).await {
                warn!("Failed to remove {} from {}: {}", node, from, e);
            }
        }
        Err(e) => warn!("Cannot reach {} to remove {}: {}", from, node, e),
    }
    ctx.monitor().collect_now(node.into());
    Ok(true)
}
