//! Identifier types for topology components

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::TopologyError;

/// Identifier of a storage node (a host-level agent)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StorageNodeId(pub u32);

/// Identifier of a replication group (shard)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId(pub u32);

/// Identifier of a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

/// Whether a shard member holds data or only votes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Holds data and can be elected leader
    Data,
    /// Participates in elections without holding data
    Arbiter,
}

/// Identifier of a shard member
///
/// Rendered as `rg1-rn2` for data nodes and `rg1-an1` for arbiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId {
    /// Shard the node belongs to
    pub shard: ShardId,
    /// Node number, unique within the shard and kind
    pub number: u32,
    /// Data or arbiter
    pub kind: NodeKind,
}

impl NodeId {
    /// Create a data node id
    pub fn data(shard: u32, number: u32) -> Self {
        Self {
            shard: ShardId(shard),
            number,
            kind: NodeKind::Data,
        }
    }

    /// Create an arbiter node id
    pub fn arbiter(shard: u32, number: u32) -> Self {
        Self {
            shard: ShardId(shard),
            number,
            kind: NodeKind::Arbiter,
        }
    }

    /// Whether this node can be elected leader
    pub fn is_electable(&self) -> bool {
        self.kind == NodeKind::Data
    }
}

/// Any topology component, used as change-log and lock key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ComponentId {
    /// A storage node
    StorageNode(StorageNodeId),
    /// A replication group
    Shard(ShardId),
    /// A shard member
    Node(NodeId),
    /// A partition
    Partition(PartitionId),
}

impl fmt::Display for StorageNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sn{}", self.0)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rg{}", self.0)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.kind {
            NodeKind::Data => "rn",
            NodeKind::Arbiter => "an",
        };
        write!(f, "{}-{}{}", self.shard, prefix, self.number)
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentId::StorageNode(id) => fmt::Display::fmt(id, f),
            ComponentId::Shard(id) => fmt::Display::fmt(id, f),
            ComponentId::Node(id) => fmt::Display::fmt(id, f),
            ComponentId::Partition(id) => fmt::Display::fmt(id, f),
        }
    }
}

impl From<StorageNodeId> for ComponentId {
    fn from(id: StorageNodeId) -> Self {
        ComponentId::StorageNode(id)
    }
}

impl From<ShardId> for ComponentId {
    fn from(id: ShardId) -> Self {
        ComponentId::Shard(id)
    }
}

impl From<NodeId> for ComponentId {
    fn from(id: NodeId) -> Self {
        ComponentId::Node(id)
    }
}

impl From<PartitionId> for ComponentId {
    fn from(id: PartitionId) -> Self {
        ComponentId::Partition(id)
    }
}

fn parse_prefixed(s: &str, prefix: &str) -> Result<u32, TopologyError> {
    s.strip_prefix(prefix)
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| TopologyError::InvalidId(s.to_string()))
}

impl FromStr for StorageNodeId {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_prefixed(s, "sn").map(StorageNodeId)
    }
}

impl FromStr for ShardId {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_prefixed(s, "rg").map(ShardId)
    }
}

impl FromStr for NodeId {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (shard, node) = s
            .split_once('-')
            .ok_or_else(|| TopologyError::InvalidId(s.to_string()))?;
        let shard: ShardId = shard.parse()?;
        if let Some(n) = node.strip_prefix("rn") {
            let number = n
                .parse()
                .map_err(|_| TopologyError::InvalidId(s.to_string()))?;
            Ok(NodeId {
                shard,
                number,
                kind: NodeKind::Data,
            })
        } else {
            let number = parse_prefixed(node, "an")
                .map_err(|_| TopologyError::InvalidId(s.to_string()))?;
            Ok(NodeId {
                shard,
                number,
                kind: NodeKind::Arbiter,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_render_and_parse() {
        let rn = NodeId::data(3, 2);
        assert_eq!(rn.to_string(), "rg3-rn2");
        assert_eq!("rg3-rn2".parse::<NodeId>().unwrap(), rn);

        let an = NodeId::arbiter(1, 1);
        assert_eq!(an.to_string(), "rg1-an1");
        assert_eq!("rg1-an1".parse::<NodeId>().unwrap(), an);
        assert!(!an.is_electable());
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!("rg1".parse::<NodeId>().is_err());
        assert!("rg1-xx2".parse::<NodeId>().is_err());
        assert!("sn".parse::<StorageNodeId>().is_err());
        assert_eq!("sn12".parse::<StorageNodeId>().unwrap(), StorageNodeId(12));
    }
}
