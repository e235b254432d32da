//! Tasks that change the cluster layout

use async_trait::async_trait;
use kvplane_topology::{
    ComponentId, Node, NodeId, NodeParams, Partition, PartitionId, ShardId, StorageNode,
    StorageNodeId, StorageNodeParams,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{Task, broadcast_saved, save_and_broadcast};
use crate::cleanup::CleanupJob;
use crate::context::PlanContext;
use crate::error::{PlanError, PlanResult};
use crate::fault::FaultPoint;
use crate::health;
use crate::membership;
use crate::state::TaskState;

/// Add a storage node to the topology and parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddStorageNode {
    /// New storage node
    pub sn: StorageNodeId,
    /// Host name
    pub host: String,
    /// Agent port
    pub port: u16,
    /// Root directory for node data
    pub root_dir: String,
}

#[async_trait]
impl Task for AddStorageNode {
    fn name(&self) -> String {
        format!("AddStorageNode({})", self.sn)
    }

    fn lock_components(&self) -> Vec<ComponentId> {
        vec![self.sn.into()]
    }

    async fn execute(&self, ctx: &PlanContext) -> PlanResult<TaskState> {
        let mut topology = ctx.admin().current_topology().await?;
        if let Some(existing) = topology.storage_node(self.sn) {
            if existing.host != self.host || existing.port != self.port {
                return Err(PlanError::invalid_state(format!(
                    "{} already exists at {}:{}",
                    self.sn, existing.host, existing.port
                )));
            }
            debug!("{} already in topology", self.sn);
        } else {
            topology.add_storage_node(StorageNode::new(self.sn, self.host.clone(), self.port))?;
            ctx.fault(FaultPoint::BeforeSave, &self.name())?;
            ctx.admin().save_topology(&topology).await?;
            info!("Added {} at {}:{}", self.sn, self.host, self.port);
        }

        let params = ctx.admin().current_parameters().await?;
        if params.storage_node(self.sn).is_none() {
            ctx.admin()
                .update_storage_node_params(StorageNodeParams {
                    id: self.sn,
                    host: self.host.clone(),
                    port: self.port,
                    root_dir: self.root_dir.clone(),
                })
                .await?;
        }
        ctx.monitor().register(self.sn.into());
        Ok(TaskState::Succeeded)
    }
}

/// Add a replication group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddShard {
    /// New shard
    pub shard: ShardId,
}

#[async_trait]
impl Task for AddShard {
    fn name(&self) -> String {
        format!("AddShard({})", self.shard)
    }

    fn lock_components(&self) -> Vec<ComponentId> {
        vec![self.shard.into()]
    }

    async fn execute(&self, ctx: &PlanContext) -> PlanResult<TaskState> {
        let mut topology = ctx.admin().current_topology().await?;
        if topology.shard(self.shard).is_some() {
            debug!("{} already in topology", self.shard);
            return Ok(TaskState::Succeeded);
        }
        topology.add_shard(self.shard)?;
        ctx.fault(FaultPoint::BeforeSave, &self.name())?;
        ctx.admin().save_topology(&topology).await?;
        info!("Added {}", self.shard);
        Ok(TaskState::Succeeded)
    }
}

/// Assign partitions to a shard, moving them if they live elsewhere
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignPartitions {
    /// Receiving shard
    pub shard: ShardId,
    /// Partitions to place on it
    pub partitions: Vec<PartitionId>,
}

#[async_trait]
impl Task for AssignPartitions {
    fn name(&self) -> String {
        format!("AssignPartitions({})", self.shard)
    }

    fn lock_components(&self) -> Vec<ComponentId> {
        vec![self.shard.into()]
    }

    async fn execute(&self, ctx: &PlanContext) -> PlanResult<TaskState> {
        let mut topology = ctx.admin().current_topology().await?;
        if topology.shard(self.shard).is_none() {
            return Err(PlanError::not_found(self.shard.into()));
        }

        let mut changed = 0;
        for id in &self.partitions {
            let partition = Partition {
                id: *id,
                shard: self.shard,
            };
            match topology.partition(*id) {
                Some(existing) if existing.shard == self.shard => {}
                Some(_) => {
                    topology.update_partition(partition)?;
                    changed += 1;
                }
                None => {
                    topology.add_partition(partition)?;
                    changed += 1;
                }
            }
        }

        if changed == 0 {
            debug!("Partitions already on {}", self.shard);
            return Ok(TaskState::Succeeded);
        }
        info!("Assigned {} partitions to {}", changed, self.shard);
        save_and_broadcast(ctx, &self.name(), &topology).await
    }
}

/// Add a node to a shard and create it on its storage node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddNode {
    /// New node
    pub node: NodeId,
    /// Hosting storage node
    pub storage_node: StorageNodeId,
    /// Replication address
    pub ha_host_port: String,
}

#[async_trait]
impl Task for AddNode {
    fn name(&self) -> String {
        format!("AddNode({})", self.node)
    }

    fn lock_components(&self) -> Vec<ComponentId> {
        vec![self.node.shard.into(), self.node.into()]
    }

    async fn execute(&self, ctx: &PlanContext) -> PlanResult<TaskState> {
        let mut topology = ctx.admin().current_topology().await?;
        if topology.shard(self.node.shard).is_none() {
            return Err(PlanError::not_found(self.node.shard.into()));
        }
        if topology.storage_node(self.storage_node).is_none() {
            return Err(PlanError::not_found(self.storage_node.into()));
        }

        match topology.node(self.node) {
            Some(existing) if existing.storage_node() == self.storage_node => {
                debug!("{} already on {}", self.node, self.storage_node);
            }
            Some(existing) => {
                return Err(PlanError::invalid_state(format!(
                    "{} already exists on {}",
                    self.node,
                    existing.storage_node()
                )));
            }
            None => {
                topology.add_node(Node::new(self.node, self.storage_node))?;
                let params = NodeParams::new(self.node, self.storage_node, self.ha_host_port.clone());
                ctx.fault(FaultPoint::BeforeSave, &self.name())?;
                ctx.admin()
                    .save_topology_with_params(&topology, &[params])
                    .await?;
                info!("Added {} on {}", self.node, self.storage_node);
                ctx.fault(FaultPoint::AfterSave, &self.name())?;
            }
        }

        let params = ctx.admin().current_parameters().await?;
        let node_params = params.node(self.node).cloned().ok_or_else(|| {
            PlanError::inconsistent(format!("{} has no parameters", self.node))
        })?;
        let agent = ctx.agent(self.storage_node).await?;
        ctx.call(agent.start_node(&node_params)).await?;

        ctx.monitor().register(self.node.into());
        ctx.monitor().collect_now(self.node.into());
        Ok(TaskState::Succeeded)
    }
}

/// Remove a node from its shard and destroy it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveNode {
    /// Node to remove
    pub node: NodeId,
}

#[async_trait]
impl Task for RemoveNode {
    fn name(&self) -> String {
        format!("RemoveNode({})", self.node)
    }

    fn lock_components(&self) -> Vec<ComponentId> {
        vec![self.node.shard.into(), self.node.into()]
    }

    fn cleanup_job(&self) -> Option<CleanupJob> {
        Some(CleanupJob::RepairNode(self.node))
    }

    async fn execute(&self, ctx: &PlanContext) -> PlanResult<TaskState> {
        let name = self.name();
        let mut topology = ctx.admin().current_topology().await?;
        let Some(node) = topology.node(self.node).cloned() else {
            debug!("{} already removed from topology", self.node);
            let state = broadcast_saved(ctx, &name, &topology).await?;
            if state != TaskState::Succeeded {
                return Ok(state);
            }
            let recorded = ctx.admin().current_parameters().await?.node(self.node).cloned();
            if let Some(params) = recorded {
                self.destroy(ctx, params.storage_node).await?;
            }
            ctx.monitor().unregister(self.node.into());
            return Ok(TaskState::Succeeded);
        };
        let sn = node.storage_node();

        health::ensure_safe_to_stop(ctx, &topology, self.node, false).await?;

        let agent = ctx.agent(sn).await?;
        ctx.call(agent.stop_node(self.node, false)).await?;
        info!("Stopped {} on {}", self.node, sn);
        ctx.fault(FaultPoint::AfterStop, &name)?;

        if !membership::remove_member(ctx, &topology, self.node).await? {
            return Ok(TaskState::Interrupted);
        }
        ctx.fault(FaultPoint::AfterMembershipChange, &name)?;

        topology.remove_node(self.node)?;
        ctx.fault(FaultPoint::BeforeSave, &name)?;
        ctx.admin().save_topology(&topology).await?;
        ctx.fault(FaultPoint::AfterSave, &name)?;

        let state = broadcast_saved(ctx, &name, &topology).await?;
        if state != TaskState::Succeeded {
            return Ok(state);
        }

        self.destroy(ctx, sn).await?;
        ctx.monitor().unregister(self.node.into());
        Ok(TaskState::Succeeded)
    }
}

impl RemoveNode {
    /// Drop the node's configuration on `sn`, then its parameters.
    ///
    /// The parameters outlive the topology entry so a rerun can still find
    /// the storage node to clean.
    async fn destroy(&self, ctx: &PlanContext, sn: StorageNodeId) -> PlanResult<()> {
        match ctx.agent(sn).await {
            Ok(agent) => match ctx.call(agent.destroy_node(self.node)).await {
                Ok(_) => info!("Removed {} from {}", self.node, sn),
                Err(e) => warn!("Failed to destroy {} on {}: {}", self.node, sn, e),
            },
            Err(e) => warn!("Cannot reach {} to destroy {}: {}", sn, self.node, e),
        }
        ctx.admin().remove_node_params(self.node).await?;
        Ok(())
    }
}

/// Move a node to another storage node under a new replication address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelocateNode {
    /// Node to move
    pub node: NodeId,
    /// Current storage node
    pub old_sn: StorageNodeId,
    /// Destination storage node
    pub new_sn: StorageNodeId,
    /// Replication address on the destination
    pub new_ha_host_port: String,
}

#[async_trait]
impl Task for RelocateNode {
    fn name(&self) -> String {
        format!("RelocateNode({} {}->{})", self.node, self.old_sn, self.new_sn)
    }

    fn lock_components(&self) -> Vec<ComponentId> {
        vec![
            self.node.shard.into(),
            self.node.into(),
            self.old_sn.into(),
            self.new_sn.into(),
        ]
    }

    fn cleanup_job(&self) -> Option<CleanupJob> {
        Some(CleanupJob::RepairNode(self.node))
    }

    async fn execute(&self, ctx: &PlanContext) -> PlanResult<TaskState> {
        let name = self.name();
        let mut topology = ctx.admin().current_topology().await?;
        let params = ctx.admin().current_parameters().await?;
        let mut node = topology
            .node(self.node)
            .cloned()
            .ok_or_else(|| PlanError::not_found(self.node.into()))?;
        if topology.storage_node(self.new_sn).is_none() {
            return Err(PlanError::not_found(self.new_sn.into()));
        }
        let mut node_params = params.node(self.node).cloned().ok_or_else(|| {
            PlanError::inconsistent(format!("{} has no parameters", self.node))
        })?;

        let applied = node.storage_node() == self.new_sn
            && node_params.ha_host_port == self.new_ha_host_port;
        if applied {
            debug!("{} already recorded on {}", self.node, self.new_sn);
            let state = broadcast_saved(ctx, &name, &topology).await?;
            if state != TaskState::Succeeded {
                return Ok(state);
            }
        } else {
            if node.storage_node() != self.old_sn {
                return Err(PlanError::invalid_state(format!(
                    "{} is on {}, not {}",
                    self.node,
                    node.storage_node(),
                    self.old_sn
                )));
            }

            health::ensure_safe_to_stop(ctx, &topology, self.node, false).await?;
            if !health::await_catch_up(ctx, &topology, self.node.shard, Some(self.node)).await? {
                return Ok(TaskState::Interrupted);
            }

            let old_agent = ctx.agent(self.old_sn).await?;
            ctx.call(old_agent.stop_node(self.node, false)).await?;
            info!("Stopped {} on {}", self.node, self.old_sn);
            ctx.fault(FaultPoint::AfterStop, &name)?;

            if !membership::change_address(ctx, &topology, self.node, &self.new_ha_host_port)
                .await?
            {
                return Ok(TaskState::Interrupted);
            }
            ctx.fault(FaultPoint::AfterMembershipChange, &name)?;

            node.set_storage_node(self.new_sn);
            topology.update_node(node)?;
            node_params.storage_node = self.new_sn;
            node_params.ha_host_port = self.new_ha_host_port.clone();
            ctx.fault(FaultPoint::BeforeSave, &name)?;
            ctx.admin()
                .save_topology_with_params(&topology, &[node_params.clone()])
                .await?;
            ctx.fault(FaultPoint::AfterSave, &name)?;

            let state = broadcast_saved(ctx, &name, &topology).await?;
            if state != TaskState::Succeeded {
                return Ok(state);
            }
        }

        let new_agent = ctx.agent(self.new_sn).await?;
        ctx.call(new_agent.start_node(&node_params)).await?;
        info!("Started {} on {}", self.node, self.new_sn);

        match ctx.agent(self.old_sn).await {
            Ok(old_agent) => {
                if let Err(e) = ctx.call(old_agent.destroy_node(self.node)).await {
                    warn!("Failed to destroy {} on {}: {}", self.node, self.old_sn, e);
                }
            }
            Err(e) => warn!("Cannot reach {}: {}", self.old_sn, e),
        }
        ctx.monitor().collect_now(self.node.into());
        Ok(TaskState::Succeeded)
    }
}

/// Change a node's replication address in place
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNodeAddress {
    /// Node to change
    pub node: NodeId,
    /// New replication address
    pub new_ha_host_port: String,
}

#[async_trait]
impl Task for ChangeNodeAddress {
    fn name(&self) -> String {
        format!("ChangeNodeAddress({})", self.node)
    }

    fn lock_components(&self) -> Vec<ComponentId> {
        vec![self.node.shard.into(), self.node.into()]
    }

    fn cleanup_job(&self) -> Option<CleanupJob> {
        Some(CleanupJob::RepairNode(self.node))
    }

    async fn execute(&self, ctx: &PlanContext) -> PlanResult<TaskState> {
        let name = self.name();
        let topology = ctx.admin().current_topology().await?;
        let node = topology
            .node(self.node)
            .ok_or_else(|| PlanError::not_found(self.node.into()))?;
        let params = ctx.admin().current_parameters().await?;
        let mut node_params = params.node(self.node).cloned().ok_or_else(|| {
            PlanError::inconsistent(format!("{} has no parameters", self.node))
        })?;
        if node_params.ha_host_port == self.new_ha_host_port {
            debug!("{} already at {}", self.node, self.new_ha_host_port);
            return Ok(TaskState::Succeeded);
        }

        health::verify_quorum(ctx, &topology, self.node.shard, Some(self.node)).await?;
        if !membership::change_address(ctx, &topology, self.node, &self.new_ha_host_port).await? {
            return Ok(TaskState::Interrupted);
        }
        ctx.fault(FaultPoint::AfterMembershipChange, &name)?;

        node_params.ha_host_port = self.new_ha_host_port.clone();
        ctx.fault(FaultPoint::BeforeSave, &name)?;
        ctx.admin().update_node_params(node_params.clone()).await?;
        ctx.fault(FaultPoint::AfterSave, &name)?;

        let agent = ctx.agent(node.storage_node()).await?;
        ctx.call(agent.new_node_parameters(&node_params)).await?;
        info!("{} now at {}", self.node, self.new_ha_host_port);
        ctx.monitor().collect_now(self.node.into());
        Ok(TaskState::Succeeded)
    }
}
