//! Versioned cluster layout with an append-only change log

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::Persisted;
use crate::node::{Component, Node, Partition, ReplicationGroup, StorageNode};
use crate::{
    ComponentId, NodeId, PartitionId, ShardId, StorageNodeId, TopologyError, TopologyResult,
};

/// Sequence number reported by a node that holds no copy of an artifact
pub const EMPTY_SEQUENCE_NUMBER: u64 = 0;

/// A single change to the topology
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub enum ChangeOp {
    /// Component added
    Add(Component),
    /// Component replaced
    Update(Component),
    /// Component removed
    Remove(ComponentId),
}

/// A change-log entry
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TopologyChange {
    /// Sequence number the topology has after applying this change
    pub sequence_number: u64,
    /// The change
    pub op: ChangeOp,
}

/// Changes recorded since `baseline`, in sequence order
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
struct ChangeLog {
    baseline: u64,
    changes: Vec<TopologyChange>,
}

/// The cluster layout
///
/// Every mutation bumps the sequence number by one and appends exactly one
/// change-log entry, so replaying the log entries after sequence number N
/// against the topology at N reproduces the current layout.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Topology {
    store_name: String,
    sequence_number: u64,
    storage_nodes: BTreeMap<StorageNodeId, StorageNode>,
    shards: BTreeMap<ShardId, ReplicationGroup>,
    nodes: BTreeMap<NodeId, Node>,
    partitions: BTreeMap<PartitionId, Partition>,
    #[serde(default)]
    change_log: ChangeLog,
}

impl Topology {
    /// Create an empty topology
    pub fn new(store_name: impl Into<String>) -> Self {
        Self {
            store_name: store_name.into(),
            sequence_number: EMPTY_SEQUENCE_NUMBER,
            storage_nodes: BTreeMap::new(),
            shards: BTreeMap::new(),
            nodes: BTreeMap::new(),
            partitions: BTreeMap::new(),
            change_log: ChangeLog::default(),
        }
    }

    /// Name of the store
    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    /// Current sequence number
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// Sequence number before the oldest retained change-log entry
    pub fn change_log_baseline(&self) -> u64 {
        self.change_log.baseline
    }

    /// Compare layouts, ignoring the change logs
    pub fn layout_eq(&self, other: &Topology) -> bool {
        self.store_name == other.store_name
            && self.sequence_number == other.sequence_number
            && self.storage_nodes == other.storage_nodes
            && self.shards == other.shards
            && self.nodes == other.nodes
            && self.partitions == other.partitions
    }

    // ============ Queries ============

    /// Get a storage node
    pub fn storage_node(&self, id: StorageNodeId) -> Option<&StorageNode> {
        self.storage_nodes.get(&id)
    }

    /// All storage nodes
    pub fn storage_nodes(&self) -> impl Iterator<Item = &StorageNode> {
        self.storage_nodes.values()
    }

    /// Get a shard
    pub fn shard(&self, id: ShardId) -> Option<&ReplicationGroup> {
        self.shards.get(&id)
    }

    /// All shards
    pub fn shards(&self) -> impl Iterator<Item = &ReplicationGroup> {
        self.shards.values()
    }

    /// Get a node
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// All nodes
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// All data-bearing nodes
    pub fn data_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(|n| n.is_data())
    }

    /// Members of a shard
    pub fn nodes_in_shard(&self, shard: ShardId) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(move |n| n.shard() == shard)
    }

    /// Electable (data) members of a shard
    pub fn electable_nodes(&self, shard: ShardId) -> impl Iterator<Item = &Node> {
        self.nodes_in_shard(shard).filter(|n| n.is_data())
    }

    /// Arbiter members of a shard
    pub fn arbiters(&self, shard: ShardId) -> impl Iterator<Item = &Node> {
        self.nodes_in_shard(shard).filter(|n| n.is_arbiter())
    }

    /// Nodes hosted on a storage node
    pub fn nodes_on_storage_node(&self, sn: StorageNodeId) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(move |n| n.storage_node() == sn)
    }

    /// Get a partition
    pub fn partition(&self, id: PartitionId) -> Option<&Partition> {
        self.partitions.get(&id)
    }

    /// Partitions held by a shard
    pub fn partitions_of(&self, shard: ShardId) -> impl Iterator<Item = &Partition> {
        self.partitions.values().filter(move |p| p.shard == shard)
    }

    /// Whether the component is present
    pub fn contains(&self, id: ComponentId) -> bool {
        match id {
            ComponentId::StorageNode(id) => self.storage_nodes.contains_key(&id),
            ComponentId::Shard(id) => self.shards.contains_key(&id),
            ComponentId::Node(id) => self.nodes.contains_key(&id),
            ComponentId::Partition(id) => self.partitions.contains_key(&id),
        }
    }

    // ============ Mutations ============

    /// Add a storage node
    pub fn add_storage_node(&mut self, sn: StorageNode) -> TopologyResult<()> {
        self.record(ChangeOp::Add(sn.into()))
    }

    /// Replace a storage node
    pub fn update_storage_node(&mut self, sn: StorageNode) -> TopologyResult<()> {
        self.record(ChangeOp::Update(sn.into()))
    }

    /// Remove a storage node
    pub fn remove_storage_node(&mut self, id: StorageNodeId) -> TopologyResult<()> {
        self.record(ChangeOp::Remove(ComponentId::StorageNode(id)))
    }

    /// Add a shard
    pub fn add_shard(&mut self, id: ShardId) -> TopologyResult<()> {
        self.record(ChangeOp::Add(ReplicationGroup { id }.into()))
    }

    /// Remove an empty shard
    pub fn remove_shard(&mut self, id: ShardId) -> TopologyResult<()> {
        self.record(ChangeOp::Remove(ComponentId::Shard(id)))
    }

    /// Add a node
    pub fn add_node(&mut self, node: Node) -> TopologyResult<()> {
        self.record(ChangeOp::Add(node.into()))
    }

    /// Replace a node
    pub fn update_node(&mut self, node: Node) -> TopologyResult<()> {
        self.record(ChangeOp::Update(node.into()))
    }

    /// Remove a node
    pub fn remove_node(&mut self, id: NodeId) -> TopologyResult<()> {
        self.record(ChangeOp::Remove(ComponentId::Node(id)))
    }

    /// Add a partition
    pub fn add_partition(&mut self, partition: Partition) -> TopologyResult<()> {
        self.record(ChangeOp::Add(partition.into()))
    }

    /// Reassign a partition
    pub fn update_partition(&mut self, partition: Partition) -> TopologyResult<()> {
        self.record(ChangeOp::Update(partition.into()))
    }

    fn record(&mut self, op: ChangeOp) -> TopologyResult<()> {
        self.apply_op(&op)?;
        self.sequence_number += 1;
        self.change_log.changes.push(TopologyChange {
            sequence_number: self.sequence_number,
            op,
        });
        Ok(())
    }

    fn apply_op(&mut self, op: &ChangeOp) -> TopologyResult<()> {
        match op {
            ChangeOp::Add(component) => {
                let id = component.id();
                if self.contains(id) {
                    return Err(TopologyError::AlreadyExists(id));
                }
                self.check_references(component)?;
                self.put(component.clone());
            }
            ChangeOp::Update(component) => {
                let id = component.id();
                if !self.contains(id) {
                    return Err(TopologyError::NotFound(id));
                }
                self.check_references(component)?;
                self.put(component.clone());
            }
            ChangeOp::Remove(id) => {
                if !self.contains(*id) {
                    return Err(TopologyError::NotFound(*id));
                }
                match id {
                    ComponentId::StorageNode(sn) => {
                        if let Some(node) = self.nodes_on_storage_node(*sn).next() {
                            return Err(TopologyError::Other(format!(
                                "storage node {sn} still hosts {}",
                                node.id()
                            )));
                        }
                        self.storage_nodes.remove(sn);
                    }
                    ComponentId::Shard(shard) => {
                        if self.nodes_in_shard(*shard).next().is_some()
                            || self.partitions_of(*shard).next().is_some()
                        {
                            return Err(TopologyError::Other(format!(
                                "shard {shard} is not empty"
                            )));
                        }
                        self.shards.remove(shard);
                    }
                    ComponentId::Node(node) => {
                        self.nodes.remove(node);
                    }
                    ComponentId::Partition(p) => {
                        self.partitions.remove(p);
                    }
                }
            }
        }
        Ok(())
    }

    fn check_references(&self, component: &Component) -> TopologyResult<()> {
        let (holder, missing) = match component {
            Component::Node(node) => {
                if !self.shards.contains_key(&node.shard()) {
                    (component.id(), ComponentId::Shard(node.shard()))
                } else if !self.storage_nodes.contains_key(&node.storage_node()) {
                    (component.id(), ComponentId::StorageNode(node.storage_node()))
                } else {
                    return Ok(());
                }
            }
            Component::Partition(p) if !self.shards.contains_key(&p.shard) => {
                (component.id(), ComponentId::Shard(p.shard))
            }
            _ => return Ok(()),
        };
        Err(TopologyError::DanglingReference {
            component: holder,
            missing,
        })
    }

    fn put(&mut self, component: Component) {
        match component {
            Component::StorageNode(sn) => {
                self.storage_nodes.insert(sn.id, sn);
            }
            Component::Shard(rg) => {
                self.shards.insert(rg.id, rg);
            }
            Component::Node(node) => {
                self.nodes.insert(node.id(), node);
            }
            Component::Partition(p) => {
                self.partitions.insert(p.id, p);
            }
        }
    }

    // ============ Change shipment ============

    /// Changes needed to bring a copy at `from_seq` up to date
    ///
    /// Returns `None` when the log cannot produce a delta: the caller holds no
    /// copy, or the needed entries were truncated. An up-to-date caller gets an
    /// empty list.
    pub fn changes_since(&self, from_seq: u64) -> Option<Vec<TopologyChange>> {
        if from_seq == EMPTY_SEQUENCE_NUMBER || from_seq < self.change_log.baseline {
            return None;
        }
        if from_seq >= self.sequence_number {
            return Some(Vec::new());
        }
        Some(
            self.change_log
                .changes
                .iter()
                .filter(|c| c.sequence_number > from_seq)
                .cloned()
                .collect(),
        )
    }

    /// Apply changes produced by [`Topology::changes_since`]
    ///
    /// Entries at or below the current sequence number are skipped; the rest
    /// must continue without a gap. On error the topology is left untouched.
    pub fn apply_changes(&mut self, changes: &[TopologyChange]) -> TopologyResult<()> {
        let current = self.sequence_number;
        let pending: Vec<_> = changes
            .iter()
            .filter(|c| c.sequence_number > current)
            .collect();
        for (i, change) in pending.iter().enumerate() {
            let expected = current + 1 + i as u64;
            if change.sequence_number != expected {
                return Err(TopologyError::ChangeGap {
                    expected,
                    first: change.sequence_number,
                });
            }
        }
        if pending.is_empty() {
            return Ok(());
        }

        let mut next = self.clone();
        for change in pending {
            next.apply_op(&change.op)?;
            next.sequence_number = change.sequence_number;
            next.change_log.changes.push(change.clone());
        }
        *self = next;
        debug!(
            "Applied changes to topology {}, now at sequence {}",
            self.store_name, self.sequence_number
        );
        Ok(())
    }

    /// Drop change-log entries at or below `up_to`
    pub fn truncate_change_log(&mut self, up_to: u64) {
        let up_to = up_to.min(self.sequence_number);
        if up_to <= self.change_log.baseline {
            return;
        }
        self.change_log
            .changes
            .retain(|c| c.sequence_number > up_to);
        self.change_log.baseline = up_to;
    }
}

impl Persisted for Topology {
    const SCHEMA: &'static str = "topology";
    const VERSION: u16 = 1;
}
