//! Authoritative per-component parameters

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::codec::Persisted;
use crate::{NodeId, StorageNodeId};

/// Parameters of a storage node agent
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StorageNodeParams {
    /// Storage node id
    pub id: StorageNodeId,
    /// Host name
    pub host: String,
    /// Registry port
    pub port: u16,
    /// Root directory for node data and configuration
    pub root_dir: String,
}

/// Parameters of a shard member
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NodeParams {
    /// Node id
    pub id: NodeId,
    /// Storage node hosting the node
    pub storage_node: StorageNodeId,
    /// Host and port the replication group uses to reach the node
    pub ha_host_port: String,
    /// Whether the node is administratively disabled
    #[serde(default)]
    pub disabled: bool,
    /// Additional node parameters
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl NodeParams {
    /// Create enabled parameters with no extra settings
    pub fn new(id: NodeId, storage_node: StorageNodeId, ha_host_port: impl Into<String>) -> Self {
        Self {
            id,
            storage_node,
            ha_host_port: ha_host_port.into(),
            disabled: false,
            extra: BTreeMap::new(),
        }
    }

    /// Host part of the HA address
    pub fn ha_host(&self) -> &str {
        host_of(&self.ha_host_port)
    }

    /// Whether every entry in `changes` is already set
    pub fn contains_all(&self, changes: &BTreeMap<String, String>) -> bool {
        changes
            .iter()
            .all(|(k, v)| self.extra.get(k).is_some_and(|cur| cur == v))
    }
}

/// Host part of a `host:port` string
pub fn host_of(host_port: &str) -> &str {
    host_port
        .rsplit_once(':')
        .map_or(host_port, |(host, _)| host)
}

/// Parameters of every component the admin knows about
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Parameters {
    storage_nodes: BTreeMap<StorageNodeId, StorageNodeParams>,
    nodes: BTreeMap<NodeId, NodeParams>,
}

impl Parameters {
    /// Create empty parameters
    pub fn new() -> Self {
        Self::default()
    }

    /// Get storage node parameters
    pub fn storage_node(&self, id: StorageNodeId) -> Option<&StorageNodeParams> {
        self.storage_nodes.get(&id)
    }

    /// All storage node parameters
    pub fn storage_nodes(&self) -> impl Iterator<Item = &StorageNodeParams> {
        self.storage_nodes.values()
    }

    /// Storage node whose host matches
    pub fn storage_node_by_host(&self, host: &str) -> Option<&StorageNodeParams> {
        self.storage_nodes.values().find(|sn| sn.host == host)
    }

    /// Get node parameters
    pub fn node(&self, id: NodeId) -> Option<&NodeParams> {
        self.nodes.get(&id)
    }

    /// All node parameters
    pub fn nodes(&self) -> impl Iterator<Item = &NodeParams> {
        self.nodes.values()
    }

    /// Insert or replace storage node parameters
    pub fn put_storage_node(&mut self, params: StorageNodeParams) {
        self.storage_nodes.insert(params.id, params);
    }

    /// Insert or replace node parameters
    pub fn put_node(&mut self, params: NodeParams) {
        self.nodes.insert(params.id, params);
    }

    /// Remove node parameters
    pub fn remove_node(&mut self, id: NodeId) -> Option<NodeParams> {
        self.nodes.remove(&id)
    }
}

impl Persisted for Parameters {
    const SCHEMA: &'static str = "parameters";
    const VERSION: u16 = 1;
}
