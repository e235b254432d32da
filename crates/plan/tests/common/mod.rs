//! Test helpers building small clusters out of the in-memory doubles
//!
//! Every data node `rgS-rnN` gets its own storage node `snK` on host `hostK`
//! with the replication address `hostK:5011`.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use kvplane_admin::Admin;
use kvplane_admin_mock::{MemoryAdmin, MockCluster};
use kvplane_plan::{PlanConfig, PlanContext, Planner};
use kvplane_topology::{
    Node, NodeId, NodeParams, Parameters, ShardId, StorageNode, StorageNodeId, StorageNodeParams,
    Topology,
};

/// A cluster layout with its admin store and live mock
pub struct TestCluster {
    /// Topology the admin started with
    pub topology: Topology,

    /// Parameters the admin started with
    pub params: Parameters,

    /// The admin store
    pub admin: Arc<MemoryAdmin>,

    /// The live cluster
    pub cluster: Arc<MockCluster>,
}

/// Builder for [`TestCluster`]
pub struct TestClusterBuilder {
    shards: u32,
    replication: u32,
    arbiters: bool,
    spare_storage_nodes: u32,
}

impl TestClusterBuilder {
    /// Add an arbiter to every shard
    pub fn with_arbiters(mut self) -> Self {
        self.arbiters = true;
        self
    }

    /// Add storage nodes hosting nothing
    pub fn with_spare_storage_nodes(mut self, count: u32) -> Self {
        self.spare_storage_nodes = count;
        self
    }

    /// Build the cluster
    pub fn build(self) -> TestCluster {
        let mut topology = Topology::new("kvstore");
        let mut params = Parameters::new();
        let mut next_sn = 0;

        for shard in 1..=self.shards {
            topology.add_shard(ShardId(shard)).unwrap();
            for number in 1..=self.replication {
                next_sn += 1;
                let sn = add_storage_node(&mut topology, &mut params, next_sn);
                add_node(&mut topology, &mut params, NodeId::data(shard, number), sn);
            }
            if self.arbiters {
                next_sn += 1;
                let sn = add_storage_node(&mut topology, &mut params, next_sn);
                add_node(&mut topology, &mut params, NodeId::arbiter(shard, 1), sn);
            }
        }
        for _ in 0..self.spare_storage_nodes {
            next_sn += 1;
            add_storage_node(&mut topology, &mut params, next_sn);
        }

        let admin = MemoryAdmin::new(&topology, &params).unwrap();
        let cluster = MockCluster::from_topology(&topology, &params);
        TestCluster {
            topology,
            params,
            admin: Arc::new(admin),
            cluster: Arc::new(cluster),
        }
    }
}

fn add_storage_node(topology: &mut Topology, params: &mut Parameters, n: u32) -> StorageNodeId {
    let sn = StorageNodeId(n);
    topology
        .add_storage_node(StorageNode::new(sn, host(n), 5000))
        .unwrap();
    params.put_storage_node(StorageNodeParams {
        id: sn,
        host: host(n),
        port: 5000,
        root_dir: format!("/var/kvstore/{sn}"),
    });
    sn
}

fn add_node(topology: &mut Topology, params: &mut Parameters, node: NodeId, sn: StorageNodeId) {
    topology.add_node(Node::new(node, sn)).unwrap();
    params.put_node(NodeParams::new(node, sn, ha_address(sn.0)));
}

/// Host name of storage node `n`
pub fn host(n: u32) -> String {
    format!("host{n}")
}

/// Replication address of a node on storage node `n`
pub fn ha_address(n: u32) -> String {
    format!("host{n}:5011")
}

impl TestCluster {
    /// Start a builder for `shards` shards of `replication` data nodes each
    pub fn builder(shards: u32, replication: u32) -> TestClusterBuilder {
        TestClusterBuilder {
            shards,
            replication,
            arbiters: false,
            spare_storage_nodes: 0,
        }
    }

    /// A single shard of three data nodes
    pub fn three_nodes() -> Self {
        Self::builder(1, 3).build()
    }

    /// A context for running protocols and tasks outside a planner
    pub fn context(&self) -> PlanContext {
        self.context_with(fast_config())
    }

    /// A context using `config`
    pub fn context_with(&self, config: PlanConfig) -> PlanContext {
        PlanContext::new(1, "test", self.admin.clone(), self.cluster.clone())
            .with_config(Arc::new(config))
    }

    /// A planner over this cluster
    pub fn planner(&self) -> Planner {
        Planner::new(self.admin.clone(), self.cluster.clone(), fast_config())
    }

    /// Current topology in the admin store
    pub async fn current_topology(&self) -> Topology {
        self.admin.current_topology().await.unwrap()
    }

    /// Current parameters in the admin store
    pub async fn current_parameters(&self) -> Parameters {
        self.admin.current_parameters().await.unwrap()
    }
}

/// Configuration with millisecond delays
pub fn fast_config() -> PlanConfig {
    let mut config = PlanConfig::default();
    config.broadcast.retry_delay = Duration::from_millis(10);
    config.membership.retry_delay = Duration::from_millis(10);
    config.health.poll_interval = Duration::from_millis(10);
    config.health.catch_up_timeout = Duration::from_millis(500);
    config.health.arbiter_recheck_delay = Duration::from_millis(10);
    config.cleanup.retry_delay = Duration::from_millis(10);
    config.cleanup.max_attempts = 3;
    config.executor.continuation_delay = Duration::from_millis(10);
    config.rpc_timeout = Duration::from_secs(5);
    config
}
