//! Remote control interfaces of storage node agents and shard members

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use kvplane_topology::{
    Metadata, MetadataChange, MetadataKind, NodeId, NodeParams, StorageNodeId, Topology,
    TopologyChange,
};
use serde::{Deserialize, Serialize};

use crate::{LoginContext, RemoteResult};

/// Service state reported by a node or agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceState {
    /// Starting up
    Starting,
    /// Running and serving requests
    Running,
    /// Stopped by request
    Stopped,
    /// Failed and waiting to be restarted
    ErrorRestarting,
}

impl ServiceState {
    /// Whether the service is up
    pub fn is_running(&self) -> bool {
        *self == ServiceState::Running
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Replication role of a shard member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaRole {
    /// Elected leader
    Leader,
    /// Following a leader
    Replica,
    /// Not currently part of an active group
    Detached,
}

/// Live status of a shard member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Service state
    pub state: ServiceState,
    /// Replication role
    pub role: ReplicaRole,
    /// Storage node the member reports running on
    pub storage_node: Option<StorageNodeId>,
    /// Replication lag behind the leader, in milliseconds
    pub replica_lag_ms: Option<u64>,
}

/// Topology update shipped to a member
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyUpdate {
    /// Complete snapshot
    Full(Box<Topology>),
    /// Changes since the member's sequence number
    Delta(Vec<TopologyChange>),
}

/// Metadata update shipped to a member
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataUpdate {
    /// Complete snapshot
    Full(Box<Metadata>),
    /// Changes since the member's sequence number
    Delta(Vec<MetadataChange>),
}

/// Reply to a membership change request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipReply {
    /// The group committed the change
    Applied,
    /// The group has no elected leader to commit the change
    NoLeader,
}

/// Reply to a membership address query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberAddress {
    /// The address the group has recorded for the member
    Known(String),
    /// The member is not part of the group
    NotMember,
    /// The group has no elected leader to answer
    NoLeader,
}

/// Control interface of a storage node agent
#[async_trait]
pub trait StorageNodeAgent: Send + Sync {
    /// Agent service state
    async fn ping(&self) -> RemoteResult<ServiceState>;

    /// Start a node, creating its on-disk configuration if absent
    async fn start_node(&self, params: &NodeParams) -> RemoteResult<()>;

    /// Stop a node, returning whether it was running
    async fn stop_node(&self, node: NodeId, force: bool) -> RemoteResult<bool>;

    /// Stop a node and remove its data and configuration, returning whether
    /// anything was removed
    async fn destroy_node(&self, node: NodeId) -> RemoteResult<bool>;

    /// Replace the on-disk parameters of a node
    async fn new_node_parameters(&self, params: &NodeParams) -> RemoteResult<()>;

    /// On-disk configuration of a node, if the agent has one
    async fn node_config(&self, node: NodeId) -> RemoteResult<Option<NodeParams>>;
}

/// Admin endpoint of a data or arbiter node
#[async_trait]
pub trait NodeAdmin: Send + Sync {
    /// Live status
    async fn ping(&self) -> RemoteResult<NodeStatus>;

    /// Sequence number of the member's topology copy
    async fn topology_seq_num(&self) -> RemoteResult<u64>;

    /// Apply a topology update, returning the resulting sequence number
    async fn update_topology(&self, update: TopologyUpdate) -> RemoteResult<u64>;

    /// Sequence number of the member's metadata copy
    async fn metadata_seq_num(&self, kind: MetadataKind) -> RemoteResult<u64>;

    /// Apply a metadata update, returning the resulting sequence number
    async fn update_metadata(&self, kind: MetadataKind, update: MetadataUpdate)
    -> RemoteResult<u64>;

    /// Replace the member's in-memory parameters
    async fn new_parameters(&self, params: &NodeParams) -> RemoteResult<()>;

    /// Ask the group to record a new address for another member
    async fn update_member_address(
        &self,
        target: NodeId,
        host_port: &str,
    ) -> RemoteResult<MembershipReply>;

    /// Ask the group to drop another member
    async fn remove_member(&self, target: NodeId) -> RemoteResult<MembershipReply>;

    /// Address the group has recorded for a member
    async fn member_address(&self, target: NodeId) -> RemoteResult<MemberAddress>;
}

/// Resolves remote handles for cluster components
#[async_trait]
pub trait NodeRegistry: Send + Sync + 'static {
    /// Handle to a storage node agent
    async fn storage_node_agent(
        &self,
        sn: StorageNodeId,
        login: &LoginContext,
    ) -> RemoteResult<Arc<dyn StorageNodeAgent>>;

    /// Handle to a shard member's admin endpoint
    async fn node_admin(&self, node: NodeId, login: &LoginContext)
    -> RemoteResult<Arc<dyn NodeAdmin>>;

    /// Drop cached handles so the next lookup resolves them again
    async fn refresh(&self);
}
