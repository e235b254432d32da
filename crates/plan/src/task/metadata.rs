//! Declarative schema and security edits

use async_trait::async_trait;
use kvplane_topology::{Metadata, MetadataEntry, MetadataKind, TableDef, UserDef};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Task, broadcast_state};
use crate::broadcast::broadcast_metadata;
use crate::context::PlanContext;
use crate::error::{PlanError, PlanResult};
use crate::fault::FaultPoint;
use crate::state::TaskState;

/// Apply `edit` to the current metadata of `kind`, save it if it changed, and
/// broadcast it.
///
/// `edit` returns whether it changed anything. Broadcasting an unchanged copy
/// is harmless and finishes the work of an earlier interrupted run.
async fn edit_metadata<F>(
    ctx: &PlanContext,
    task: &str,
    kind: MetadataKind,
    edit: F,
) -> PlanResult<TaskState>
where
    F: FnOnce(&mut Metadata) -> PlanResult<bool> + Send,
{
    let mut metadata = ctx
        .admin()
        .metadata(kind)
        .await?
        .unwrap_or_else(|| Metadata::new(kind));

    if edit(&mut metadata)? {
        ctx.fault(FaultPoint::BeforeSave, task)?;
        ctx.admin().save_metadata(&metadata).await?;
        ctx.fault(FaultPoint::AfterSave, task)?;
        info!("{} saved {} metadata {}", task, kind, metadata.sequence_number());
    } else {
        debug!("{} already applied", task);
    }

    let topology = ctx.admin().current_topology().await?;
    ctx.fault(FaultPoint::BeforeBroadcast, task)?;
    Ok(broadcast_state(
        broadcast_metadata(ctx, &topology, &metadata).await?,
    ))
}

/// Create a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTable {
    /// Table definition
    pub table: TableDef,
}

#[async_trait]
impl Task for CreateTable {
    fn name(&self) -> String {
        format!("CreateTable({})", self.table.name)
    }

    async fn execute(&self, ctx: &PlanContext) -> PlanResult<TaskState> {
        edit_metadata(ctx, &self.name(), MetadataKind::Table, |metadata| {
            match metadata.table(&self.table.name).cloned() {
                Some(existing) if existing == self.table => Ok(false),
                Some(_) => Err(PlanError::invalid_state(format!(
                    "table {} exists with a different definition",
                    self.table.name
                ))),
                None => {
                    metadata.put(self.table.name.clone(), MetadataEntry::Table(self.table.clone()));
                    Ok(true)
                }
            }
        })
        .await
    }
}

/// Replace the definition of an existing table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlterTable {
    /// New table definition
    pub table: TableDef,
}

#[async_trait]
impl Task for AlterTable {
    fn name(&self) -> String {
        format!("AlterTable({})", self.table.name)
    }

    async fn execute(&self, ctx: &PlanContext) -> PlanResult<TaskState> {
        edit_metadata(ctx, &self.name(), MetadataKind::Table, |metadata| {
            match metadata.table(&self.table.name).cloned() {
                Some(existing) if existing == self.table => Ok(false),
                Some(_) => {
                    metadata.put(self.table.name.clone(), MetadataEntry::Table(self.table.clone()));
                    Ok(true)
                }
                None => Err(PlanError::invalid_state(format!(
                    "table {} does not exist",
                    self.table.name
                ))),
            }
        })
        .await
    }
}

/// Drop a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropTable {
    /// Table name
    pub name: String,
}

#[async_trait]
impl Task for DropTable {
    fn name(&self) -> String {
        format!("DropTable({})", self.name)
    }

    async fn execute(&self, ctx: &PlanContext) -> PlanResult<TaskState> {
        edit_metadata(ctx, &self.name(), MetadataKind::Table, |metadata| {
            Ok(metadata.remove(&self.name))
        })
        .await
    }
}

/// Add a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddUser {
    /// User definition
    pub user: UserDef,
}

#[async_trait]
impl Task for AddUser {
    fn name(&self) -> String {
        format!("AddUser({})", self.user.name)
    }

    async fn execute(&self, ctx: &PlanContext) -> PlanResult<TaskState> {
        edit_metadata(ctx, &self.name(), MetadataKind::Security, |metadata| {
            match metadata.user(&self.user.name).cloned() {
                Some(existing) if existing == self.user => Ok(false),
                Some(_) => Err(PlanError::invalid_state(format!(
                    "user {} already exists",
                    self.user.name
                ))),
                None => {
                    metadata.put(self.user.name.clone(), MetadataEntry::User(self.user.clone()));
                    Ok(true)
                }
            }
        })
        .await
    }
}

/// Remove a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveUser {
    /// User name
    pub name: String,
}

#[async_trait]
impl Task for RemoveUser {
    fn name(&self) -> String {
        format!("RemoveUser({})", self.name)
    }

    async fn execute(&self, ctx: &PlanContext) -> PlanResult<TaskState> {
        edit_metadata(ctx, &self.name(), MetadataKind::Security, |metadata| {
            Ok(metadata.remove(&self.name))
        })
        .await
    }
}
