//! Topology component types

use serde::{Deserialize, Serialize};

use crate::{ComponentId, NodeId, NodeKind, PartitionId, ShardId, StorageNodeId};

/// A host-level agent supervising node processes
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StorageNode {
    /// Storage node id
    pub id: StorageNodeId,
    /// Host name the agent listens on
    pub host: String,
    /// Registry port of the agent
    pub port: u16,
    /// Number of nodes this storage node may host
    #[serde(default = "default_capacity")]
    pub capacity: u32,
}

fn default_capacity() -> u32 {
    1
}

impl StorageNode {
    /// Create a storage node with capacity one
    pub fn new(id: StorageNodeId, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            capacity: default_capacity(),
        }
    }
}

/// A replication group
///
/// Membership is derived from the nodes recorded against the shard id.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReplicationGroup {
    /// Shard id
    pub id: ShardId,
}

/// A shard member hosted on a storage node
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Node {
    id: NodeId,
    storage_node: StorageNodeId,
}

impl Node {
    /// Create a new node
    pub fn new(id: NodeId, storage_node: StorageNodeId) -> Self {
        Node { id, storage_node }
    }

    /// Get the node id
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Get the shard this node belongs to
    pub fn shard(&self) -> ShardId {
        self.id.shard
    }

    /// Get the storage node hosting this node
    pub fn storage_node(&self) -> StorageNodeId {
        self.storage_node
    }

    /// Move the node to another storage node
    pub fn set_storage_node(&mut self, storage_node: StorageNodeId) {
        self.storage_node = storage_node;
    }

    /// Whether this node holds data
    pub fn is_data(&self) -> bool {
        self.id.kind == NodeKind::Data
    }

    /// Whether this node is an arbiter
    pub fn is_arbiter(&self) -> bool {
        self.id.kind == NodeKind::Arbiter
    }
}

/// A unit of key space assigned to exactly one shard
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Partition {
    /// Partition id
    pub id: PartitionId,
    /// Shard holding the partition
    pub shard: ShardId,
}

/// Any topology component, as carried by change-log entries
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub enum Component {
    /// A storage node
    StorageNode(StorageNode),
    /// A replication group
    Shard(ReplicationGroup),
    /// A shard member
    Node(Node),
    /// A partition
    Partition(Partition),
}

impl Component {
    /// Get the id of this component
    pub fn id(&self) -> ComponentId {
        match self {
            Component::StorageNode(sn) => ComponentId::StorageNode(sn.id),
            Component::Shard(rg) => ComponentId::Shard(rg.id),
            Component::Node(node) => ComponentId::Node(node.id),
            Component::Partition(p) => ComponentId::Partition(p.id),
        }
    }
}

impl From<StorageNode> for Component {
    fn from(sn: StorageNode) -> Self {
        Component::StorageNode(sn)
    }
}

impl From<ReplicationGroup> for Component {
    fn from(rg: ReplicationGroup) -> Self {
        Component::Shard(rg)
    }
}

impl From<Node> for Component {
    fn from(node: Node) -> Self {
        Component::Node(node)
    }
}

impl From<Partition> for Component {
    fn from(p: Partition) -> Self {
        Component::Partition(p)
    }
}
