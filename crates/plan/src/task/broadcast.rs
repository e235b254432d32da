//! Tasks that re-ship the current topology or metadata

use async_trait::async_trait;
use kvplane_topology::MetadataKind;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Task, broadcast_saved, broadcast_state};
use crate::broadcast::broadcast_metadata;
use crate::context::PlanContext;
use crate::error::PlanResult;
use crate::fault::FaultPoint;
use crate::state::TaskState;

/// Broadcast the current topology
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastTopology;

#[async_trait]
impl Task for BroadcastTopology {
    fn name(&self) -> String {
        "BroadcastTopology".to_string()
    }

    async fn execute(&self, ctx: &PlanContext) -> PlanResult<TaskState> {
        let topology = ctx.admin().current_topology().await?;
        broadcast_saved(ctx, &self.name(), &topology).await
    }
}

/// Broadcast the current metadata of a kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastMetadata {
    /// Metadata to ship
    pub kind: MetadataKind,
}

#[async_trait]
impl Task for BroadcastMetadata {
    fn name(&self) -> String {
        format!("BroadcastMetadata({})", self.kind)
    }

    async fn execute(&self, ctx: &PlanContext) -> PlanResult<TaskState> {
        let Some(metadata) = ctx.admin().metadata(self.kind).await? else {
            debug!("No {} metadata to broadcast", self.kind);
            return Ok(TaskState::Succeeded);
        };
        let topology = ctx.admin().current_topology().await?;
        ctx.fault(FaultPoint::BeforeBroadcast, &self.name())?;
        Ok(broadcast_state(
            broadcast_metadata(ctx, &topology, &metadata).await?,
        ))
    }
}
