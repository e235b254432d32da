//! The admin persistence handle

use async_trait::async_trait;
use kvplane_topology::{
    Metadata, MetadataKind, NodeId, NodeParams, Parameters, StorageNodeParams, Topology,
};

use crate::AdminError;

/// Single-writer, durable store for topology, parameters, metadata and plans.
///
/// Every method returns a snapshot or writes one atomically. Callers mutate
/// snapshots in memory and write them back through this handle before
/// broadcasting.
#[async_trait]
pub trait Admin: Send + Sync + 'static {
    /// Current topology snapshot
    async fn current_topology(&self) -> Result<Topology, AdminError>;

    /// Persist a topology
    ///
    /// Rejects a topology older than the stored one.
    async fn save_topology(&self, topology: &Topology) -> Result<(), AdminError>;

    /// Persist a topology together with node parameters, atomically
    async fn save_topology_with_params(
        &self,
        topology: &Topology,
        params: &[NodeParams],
    ) -> Result<(), AdminError>;

    /// Current parameters snapshot
    async fn current_parameters(&self) -> Result<Parameters, AdminError>;

    /// Insert or replace node parameters
    async fn update_node_params(&self, params: NodeParams) -> Result<(), AdminError>;

    /// Insert or replace storage node parameters
    async fn update_storage_node_params(&self, params: StorageNodeParams)
    -> Result<(), AdminError>;

    /// Remove node parameters
    async fn remove_node_params(&self, node: NodeId) -> Result<(), AdminError>;

    /// Current metadata of a kind, if any has been saved
    async fn metadata(&self, kind: MetadataKind) -> Result<Option<Metadata>, AdminError>;

    /// Persist metadata
    ///
    /// Rejects metadata older than the stored copy.
    async fn save_metadata(&self, metadata: &Metadata) -> Result<(), AdminError>;

    /// Persist an encoded plan record
    async fn save_plan_record(&self, plan_id: u64, record: Vec<u8>) -> Result<(), AdminError>;

    /// Load an encoded plan record
    async fn load_plan_record(&self, plan_id: u64) -> Result<Option<Vec<u8>>, AdminError>;

    /// Ids of every persisted plan
    async fn plan_ids(&self) -> Result<Vec<u64>, AdminError>;
}
