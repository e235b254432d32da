//! Scriptable in-memory cluster implementing the remote interfaces

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use kvplane_admin::{
    LoginContext, MemberAddress, MembershipReply, MetadataUpdate, NodeAdmin, NodeRegistry,
    NodeStatus, RemoteCallError, RemoteResult, ReplicaRole, ServiceState, StorageNodeAgent,
    TopologyUpdate,
};
use kvplane_topology::{
    EMPTY_SEQUENCE_NUMBER, Metadata, MetadataKind, NodeId, NodeParams, Parameters, ShardId,
    StorageNodeId, Topology,
};
use parking_lot::Mutex;
use tracing::debug;

/// Calls received by a mock node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeCalls {
    /// `ping`
    pub pings: usize,
    /// `topology_seq_num`
    pub topology_seq_queries: usize,
    /// `update_topology` with a full snapshot
    pub full_topology_updates: usize,
    /// `update_topology` with a delta
    pub delta_topology_updates: usize,
    /// `metadata_seq_num`
    pub metadata_seq_queries: usize,
    /// `update_metadata`
    pub metadata_updates: usize,
    /// `new_parameters`
    pub parameter_pushes: usize,
    /// `update_member_address`, `remove_member` and `member_address`
    pub membership_calls: usize,
}

#[derive(Debug)]
struct MockNode {
    reachable: bool,
    state: ServiceState,
    role: ReplicaRole,
    storage_node: StorageNodeId,
    replica_lag_ms: u64,
    topology: Option<Topology>,
    metadata: BTreeMap<MetadataKind, Metadata>,
    params: Option<NodeParams>,
    calls: NodeCalls,
}

impl MockNode {
    fn up(&self) -> bool {
        self.reachable && self.state.is_running()
    }
}

#[derive(Debug, Default)]
struct MockAgent {
    unreachable: bool,
    configs: BTreeMap<NodeId, NodeParams>,
    started: usize,
    stopped: usize,
    destroyed: usize,
}

#[derive(Debug, Default)]
struct MockGroup {
    members: BTreeMap<NodeId, String>,
    has_leader: bool,
}

#[derive(Debug, Default)]
struct ClusterState {
    nodes: BTreeMap<NodeId, MockNode>,
    agents: BTreeMap<StorageNodeId, MockAgent>,
    groups: BTreeMap<ShardId, MockGroup>,
}

type Shared = Arc<Mutex<ClusterState>>;

/// In-memory cluster of storage node agents and shard members.
///
/// Nodes, agents and replication groups keep just enough state to behave like
/// the real services towards the control plane, and every knob the tests need
/// (reachability, leaderless groups, lag, stale copies) can be flipped at any
/// time.
#[derive(Clone, Default)]
pub struct MockCluster {
    state: Shared,
    refreshes: Arc<AtomicUsize>,
}

impl MockCluster {
    /// Create a cluster mirroring a topology: every node running on its
    /// storage node, the lowest-numbered data node of each shard leading.
    pub fn from_topology(topology: &Topology, params: &Parameters) -> Self {
        let mut state = ClusterState::default();

        for sn in topology.storage_nodes() {
            state.agents.insert(sn.id, MockAgent::default());
        }
        for shard in topology.shards() {
            state.groups.insert(
                shard.id,
                MockGroup {
                    members: BTreeMap::new(),
                    has_leader: true,
                },
            );
        }

        let mut leaders = BTreeSet::new();
        for node in topology.nodes() {
            let node_params = params
                .node(node.id())
                .cloned()
                .unwrap_or_else(|| {
                    NodeParams::new(node.id(), node.storage_node(), format!("{}:5000", node.id()))
                });
            let role = if node.is_data() && leaders.insert(node.shard()) {
                ReplicaRole::Leader
            } else {
                ReplicaRole::Replica
            };

            state
                .agents
                .entry(node.storage_node())
                .or_default()
                .configs
                .insert(node.id(), node_params.clone());
            state
                .groups
                .entry(node.shard())
                .or_default()
                .members
                .insert(node.id(), node_params.ha_host_port.clone());
            state.nodes.insert(
                node.id(),
                MockNode {
                    reachable: true,
                    state: ServiceState::Running,
                    role,
                    storage_node: node.storage_node(),
                    replica_lag_ms: 0,
                    topology: None,
                    metadata: BTreeMap::new(),
                    params: Some(node_params),
                    calls: NodeCalls::default(),
                },
            );
        }

        Self {
            state: Arc::new(Mutex::new(state)),
            refreshes: Arc::new(AtomicUsize::new(0)),
        }
    }

    // ============ Knobs ============

    /// Make a node answer or fail every call
    pub fn set_reachable(&self, node: NodeId, reachable: bool) {
        if let Some(n) = self.state.lock().nodes.get_mut(&node) {
            n.reachable = reachable;
        }
    }

    /// Set a node's service state
    pub fn set_state(&self, node: NodeId, state: ServiceState) {
        if let Some(n) = self.state.lock().nodes.get_mut(&node) {
            n.state = state;
        }
    }

    /// Set a node's replication role
    pub fn set_role(&self, node: NodeId, role: ReplicaRole) {
        if let Some(n) = self.state.lock().nodes.get_mut(&node) {
            n.role = role;
        }
    }

    /// Set a node's replication lag
    pub fn set_replica_lag(&self, node: NodeId, lag_ms: u64) {
        if let Some(n) = self.state.lock().nodes.get_mut(&node) {
            n.replica_lag_ms = lag_ms;
        }
    }

    /// Make the storage node a member reports differ from where it was started
    pub fn set_reported_storage_node(&self, node: NodeId, sn: StorageNodeId) {
        if let Some(n) = self.state.lock().nodes.get_mut(&node) {
            n.storage_node = sn;
        }
    }

    /// Give a node its own copy of the topology
    pub fn set_node_topology(&self, node: NodeId, topology: Topology) {
        if let Some(n) = self.state.lock().nodes.get_mut(&node) {
            n.topology = Some(topology);
        }
    }

    /// Give a node its own copy of some metadata
    pub fn set_node_metadata(&self, node: NodeId, metadata: Metadata) {
        if let Some(n) = self.state.lock().nodes.get_mut(&node) {
            n.metadata.insert(metadata.kind(), metadata);
        }
    }

    /// Whether a shard currently has an elected leader
    pub fn set_group_leader(&self, shard: ShardId, has_leader: bool) {
        if let Some(g) = self.state.lock().groups.get_mut(&shard) {
            g.has_leader = has_leader;
        }
    }

    /// Record an address for a member directly in its group
    pub fn set_member_address(&self, node: NodeId, host_port: impl Into<String>) {
        self.state
            .lock()
            .groups
            .entry(node.shard)
            .or_default()
            .members
            .insert(node, host_port.into());
    }

    /// Make a storage node agent answer or fail every call
    pub fn set_agent_reachable(&self, sn: StorageNodeId, reachable: bool) {
        self.state.lock().agents.entry(sn).or_default().unreachable = !reachable;
    }

    /// Delete a node's on-disk configuration from an agent
    pub fn remove_agent_config(&self, sn: StorageNodeId, node: NodeId) {
        if let Some(a) = self.state.lock().agents.get_mut(&sn) {
            a.configs.remove(&node);
        }
    }

    // ============ Observations ============

    /// Calls a node has received
    pub fn node_calls(&self, node: NodeId) -> NodeCalls {
        self.state
            .lock()
            .nodes
            .get(&node)
            .map(|n| n.calls.clone())
            .unwrap_or_default()
    }

    /// Sum of calls received by every node
    pub fn total_calls(&self) -> NodeCalls {
        let state = self.state.lock();
        let mut total = NodeCalls::default();
        for n in state.nodes.values() {
            total.pings += n.calls.pings;
            total.topology_seq_queries += n.calls.topology_seq_queries;
            total.full_topology_updates += n.calls.full_topology_updates;
            total.delta_topology_updates += n.calls.delta_topology_updates;
            total.metadata_seq_queries += n.calls.metadata_seq_queries;
            total.metadata_updates += n.calls.metadata_updates;
            total.parameter_pushes += n.calls.parameter_pushes;
            total.membership_calls += n.calls.membership_calls;
        }
        total
    }

    /// Sequence number of a node's topology copy
    pub fn node_topology_seq(&self, node: NodeId) -> u64 {
        self.state
            .lock()
            .nodes
            .get(&node)
            .and_then(|n| n.topology.as_ref().map(Topology::sequence_number))
            .unwrap_or(EMPTY_SEQUENCE_NUMBER)
    }

    /// Sequence number of a node's metadata copy
    pub fn node_metadata_seq(&self, node: NodeId, kind: MetadataKind) -> u64 {
        self.state
            .lock()
            .nodes
            .get(&node)
            .and_then(|n| n.metadata.get(&kind).map(Metadata::sequence_number))
            .unwrap_or(EMPTY_SEQUENCE_NUMBER)
    }

    /// Service state of a node, if it exists
    pub fn node_state(&self, node: NodeId) -> Option<ServiceState> {
        self.state.lock().nodes.get(&node).map(|n| n.state)
    }

    /// Parameters a node holds in memory
    pub fn node_params(&self, node: NodeId) -> Option<NodeParams> {
        self.state
            .lock()
            .nodes
            .get(&node)
            .and_then(|n| n.params.clone())
    }

    /// Storage node a node is running on
    pub fn node_storage_node(&self, node: NodeId) -> Option<StorageNodeId> {
        self.state.lock().nodes.get(&node).map(|n| n.storage_node)
    }

    /// On-disk configuration an agent holds for a node
    pub fn agent_config(&self, sn: StorageNodeId, node: NodeId) -> Option<NodeParams> {
        self.state
            .lock()
            .agents
            .get(&sn)
            .and_then(|a| a.configs.get(&node).cloned())
    }

    /// Number of `start_node` calls an agent has served
    pub fn agent_starts(&self, sn: StorageNodeId) -> usize {
        self.state.lock().agents.get(&sn).map_or(0, |a| a.started)
    }

    /// Number of `stop_node` calls an agent has served
    pub fn agent_stops(&self, sn: StorageNodeId) -> usize {
        self.state.lock().agents.get(&sn).map_or(0, |a| a.stopped)
    }

    /// Number of `destroy_node` calls that removed something
    pub fn agent_destroys(&self, sn: StorageNodeId) -> usize {
        self.state.lock().agents.get(&sn).map_or(0, |a| a.destroyed)
    }

    /// Address a group has recorded for a member
    pub fn member_address_of(&self, node: NodeId) -> Option<String> {
        self.state
            .lock()
            .groups
            .get(&node.shard)
            .and_then(|g| g.members.get(&node).cloned())
    }

    /// Number of registry refreshes
    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeRegistry for MockCluster {
    async fn storage_node_agent(
        &self,
        sn: StorageNodeId,
        _login: &LoginContext,
    ) -> RemoteResult<Arc<dyn StorageNodeAgent>> {
        if !self.state.lock().agents.contains_key(&sn) {
            return Err(RemoteCallError::unreachable(format!(
                "storage node {sn} is not registered"
            )));
        }
        Ok(Arc::new(MockAgentHandle {
            sn,
            state: self.state.clone(),
        }))
    }

    async fn node_admin(
        &self,
        node: NodeId,
        _login: &LoginContext,
    ) -> RemoteResult<Arc<dyn NodeAdmin>> {
        if !self.state.lock().nodes.contains_key(&node) {
            return Err(RemoteCallError::unreachable(format!(
                "node {node} is not registered"
            )));
        }
        Ok(Arc::new(MockNodeHandle {
            node,
            state: self.state.clone(),
        }))
    }

    async fn refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockAgentHandle {
    sn: StorageNodeId,
    state: Shared,
}

impl MockAgentHandle {
    fn with_agent<T>(
        &self,
        f: impl FnOnce(&mut ClusterState, StorageNodeId) -> RemoteResult<T>,
    ) -> RemoteResult<T> {
        let mut state = self.state.lock();
        match state.agents.get(&self.sn) {
            Some(agent) if !agent.unreachable => f(&mut state, self.sn),
            _ => Err(RemoteCallError::unreachable(format!(
                "storage node {} is unreachable",
                self.sn
            ))),
        }
    }
}

#[async_trait]
impl StorageNodeAgent for MockAgentHandle {
    async fn ping(&self) -> RemoteResult<ServiceState> {
        self.with_agent(|_, _| Ok(ServiceState::Running))
    }

    async fn start_node(&self, params: &NodeParams) -> RemoteResult<()> {
        self.with_agent(|state, sn| {
            if let Some(agent) = state.agents.get_mut(&sn) {
                agent.configs.insert(params.id, params.clone());
                agent.started += 1;
            }
            let node = state.nodes.entry(params.id).or_insert_with(|| MockNode {
                reachable: true,
                state: ServiceState::Stopped,
                role: ReplicaRole::Replica,
                storage_node: sn,
                replica_lag_ms: 0,
                topology: None,
                metadata: BTreeMap::new(),
                params: None,
                calls: NodeCalls::default(),
            });
            node.state = ServiceState::Running;
            node.storage_node = sn;
            node.params = Some(params.clone());
            state
                .groups
                .entry(params.id.shard)
                .or_default()
                .members
                .entry(params.id)
                .or_insert_with(|| params.ha_host_port.clone());
            debug!("Mock storage node {} started {}", sn, params.id);
            Ok(())
        })
    }

    async fn stop_node(&self, node: NodeId, _force: bool) -> RemoteResult<bool> {
        self.with_agent(|state, sn| {
            if let Some(agent) = state.agents.get_mut(&sn) {
                agent.stopped += 1;
            }
            match state.nodes.get_mut(&node) {
                Some(n) if n.storage_node == sn && n.state != ServiceState::Stopped => {
                    n.state = ServiceState::Stopped;
                    if n.role == ReplicaRole::Leader {
                        n.role = ReplicaRole::Replica;
                    }
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    async fn destroy_node(&self, node: NodeId) -> RemoteResult<bool> {
        self.with_agent(|state, sn| {
            let removed = state
                .agents
                .get_mut(&sn)
                .and_then(|a| a.configs.remove(&node))
                .is_some();
            if removed {
                if let Some(agent) = state.agents.get_mut(&sn) {
                    agent.destroyed += 1;
                }
            }
            let hosted_here = state.nodes.get(&node).is_some_and(|n| n.storage_node == sn);
            if hosted_here {
                state.nodes.remove(&node);
            }
            Ok(removed)
        })
    }

    async fn new_node_parameters(&self, params: &NodeParams) -> RemoteResult<()> {
        self.with_agent(|state, sn| {
            if let Some(agent) = state.agents.get_mut(&sn) {
                agent.configs.insert(params.id, params.clone());
            }
            Ok(())
        })
    }

    async fn node_config(&self, node: NodeId) -> RemoteResult<Option<NodeParams>> {
        self.with_agent(|state, sn| {
            Ok(state
                .agents
                .get(&sn)
                .and_then(|a| a.configs.get(&node).cloned()))
        })
    }
}

struct MockNodeHandle {
    node: NodeId,
    state: Shared,
}

impl MockNodeHandle {
    fn with_node<T>(
        &self,
        f: impl FnOnce(&mut MockNode, &mut BTreeMap<ShardId, MockGroup>) -> RemoteResult<T>,
    ) -> RemoteResult<T> {
        let mut state = self.state.lock();
        let ClusterState { nodes, groups, .. } = &mut *state;
        match nodes.get_mut(&self.node) {
            Some(node) if node.up() => f(node, groups),
            _ => Err(RemoteCallError::unreachable(format!(
                "node {} is unreachable",
                self.node
            ))),
        }
    }

    fn membership_change(
        &self,
        target: NodeId,
        change: impl FnOnce(&mut MockGroup),
    ) -> RemoteResult<MembershipReply> {
        self.with_node(|node, groups| {
            node.calls.membership_calls += 1;
            let group = groups.entry(target.shard).or_default();
            if !group.has_leader {
                return Ok(MembershipReply::NoLeader);
            }
            change(group);
            Ok(MembershipReply::Applied)
        })
    }
}

#[async_trait]
impl NodeAdmin for MockNodeHandle {
    async fn ping(&self) -> RemoteResult<NodeStatus> {
        self.with_node(|node, _| {
            node.calls.pings += 1;
            Ok(NodeStatus {
                state: node.state,
                role: node.role,
                storage_node: Some(node.storage_node),
                replica_lag_ms: Some(node.replica_lag_ms),
            })
        })
    }

    async fn topology_seq_num(&self) -> RemoteResult<u64> {
        self.with_node(|node, _| {
            node.calls.topology_seq_queries += 1;
            Ok(node
                .topology
                .as_ref()
                .map_or(EMPTY_SEQUENCE_NUMBER, Topology::sequence_number))
        })
    }

    async fn update_topology(&self, update: TopologyUpdate) -> RemoteResult<u64> {
        self.with_node(|node, _| match update {
            TopologyUpdate::Full(topology) => {
                node.calls.full_topology_updates += 1;
                let seq = topology.sequence_number();
                node.topology = Some(*topology);
                Ok(seq)
            }
            TopologyUpdate::Delta(changes) => {
                node.calls.delta_topology_updates += 1;
                let topology = node
                    .topology
                    .as_mut()
                    .ok_or_else(|| RemoteCallError::rejected("no topology to apply delta to"))?;
                topology
                    .apply_changes(&changes)
                    .map_err(|e| RemoteCallError::rejected(e.to_string()))?;
                Ok(topology.sequence_number())
            }
        })
    }

    async fn metadata_seq_num(&self, kind: MetadataKind) -> RemoteResult<u64> {
        self.with_node(|node, _| {
            node.calls.metadata_seq_queries += 1;
            Ok(node
                .metadata
                .get(&kind)
                .map_or(EMPTY_SEQUENCE_NUMBER, Metadata::sequence_number))
        })
    }

    async fn update_metadata(
        &self,
        kind: MetadataKind,
        update: MetadataUpdate,
    ) -> RemoteResult<u64> {
        self.with_node(|node, _| {
            node.calls.metadata_updates += 1;
            match update {
                MetadataUpdate::Full(metadata) => {
                    let seq = metadata.sequence_number();
                    node.metadata.insert(kind, *metadata);
                    Ok(seq)
                }
                MetadataUpdate::Delta(changes) => {
                    let metadata = node
                        .metadata
                        .get_mut(&kind)
                        .ok_or_else(|| RemoteCallError::rejected("no metadata to apply delta to"))?;
                    if !metadata.apply_changes(&changes) {
                        return Err(RemoteCallError::rejected("metadata delta has a gap"));
                    }
                    Ok(metadata.sequence_number())
                }
            }
        })
    }

    async fn new_parameters(&self, params: &NodeParams) -> RemoteResult<()> {
        self.with_node(|node, _| {
            node.calls.parameter_pushes += 1;
            node.params = Some(params.clone());
            Ok(())
        })
    }

    async fn update_member_address(
        &self,
        target: NodeId,
        host_port: &str,
    ) -> RemoteResult<MembershipReply> {
        let host_port = host_port.to_string();
        self.membership_change(target, move |group| {
            group.members.insert(target, host_port);
        })
    }

    async fn remove_member(&self, target: NodeId) -> RemoteResult<MembershipReply> {
        self.membership_change(target, |group| {
            group.members.remove(&target);
        })
    }

    async fn member_address(&self, target: NodeId) -> RemoteResult<MemberAddress> {
        self.with_node(|node, groups| {
            node.calls.membership_calls += 1;
            let Some(group) = groups.get(&target.shard) else {
                return Ok(MemberAddress::NotMember);
            };
            if !group.has_leader {
                return Ok(MemberAddress::NoLeader);
            }
            Ok(group
                .members
                .get(&target)
                .cloned()
                .map_or(MemberAddress::NotMember, MemberAddress::Known))
        })
    }
}
