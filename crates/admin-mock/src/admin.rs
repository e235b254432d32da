//! In-memory admin store

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kvplane_admin::{Admin, AdminError};
use kvplane_topology::codec::{decode, encode};
use kvplane_topology::{
    Metadata, MetadataKind, NodeId, NodeParams, Parameters, StorageNodeParams, Topology,
};
use parking_lot::RwLock;

#[derive(Default)]
struct Store {
    topology: Vec<u8>,
    params: Vec<u8>,
    metadata: BTreeMap<MetadataKind, Vec<u8>>,
    plans: BTreeMap<u64, Vec<u8>>,
    topology_saves: usize,
    metadata_saves: usize,
}

/// Admin keeping every entity encoded in memory.
///
/// Entities go through the versioned codec on every read and write, the same
/// way a durable store would hold them.
#[derive(Clone)]
pub struct MemoryAdmin {
    store: Arc<RwLock<Store>>,
}

impl MemoryAdmin {
    /// Create an admin holding the given topology and parameters
    pub fn new(topology: &Topology, params: &Parameters) -> Result<Self, AdminError> {
        let store = Store {
            topology: encode(topology)?,
            params: encode(params)?,
            ..Store::default()
        };
        Ok(Self {
            store: Arc::new(RwLock::new(store)),
        })
    }

    /// Number of successful topology writes
    pub fn topology_saves(&self) -> usize {
        self.store.read().topology_saves
    }

    /// Number of successful metadata writes
    pub fn metadata_saves(&self) -> usize {
        self.store.read().metadata_saves
    }

    fn stored_topology(store: &Store) -> Result<Topology, AdminError> {
        Ok(decode(&store.topology)?)
    }

    fn stored_params(store: &Store) -> Result<Parameters, AdminError> {
        Ok(decode(&store.params)?)
    }

    fn check_topology(store: &Store, topology: &Topology) -> Result<(), AdminError> {
        let stored = Self::stored_topology(store)?.sequence_number();
        if topology.sequence_number() < stored {
            return Err(AdminError::StaleTopology {
                stored,
                attempted: topology.sequence_number(),
            });
        }
        Ok(())
    }

    fn modify_params(
        &self,
        f: impl FnOnce(&mut Parameters),
    ) -> Result<(), AdminError> {
        let mut store = self.store.write();
        let mut params = Self::stored_params(&store)?;
        f(&mut params);
        store.params = encode(&params)?;
        Ok(())
    }
}

#[async_trait]
impl Admin for MemoryAdmin {
    async fn current_topology(&self) -> Result<Topology, AdminError> {
        Self::stored_topology(&self.store.read())
    }

    async fn save_topology(&self, topology: &Topology) -> Result<(), AdminError> {
        let mut store = self.store.write();
        Self::check_topology(&store, topology)?;
        store.topology = encode(topology)?;
        store.topology_saves += 1;
        Ok(())
    }

    async fn save_topology_with_params(
        &self,
        topology: &Topology,
        params: &[NodeParams],
    ) -> Result<(), AdminError> {
        let mut store = self.store.write();
        Self::check_topology(&store, topology)?;
        let mut stored_params = Self::stored_params(&store)?;
        for p in params {
            stored_params.put_node(p.clone());
        }
        let topology_bytes = encode(topology)?;
        let params_bytes = encode(&stored_params)?;
        store.topology = topology_bytes;
        store.params = params_bytes;
        store.topology_saves += 1;
        Ok(())
    }

    async fn current_parameters(&self) -> Result<Parameters, AdminError> {
        Self::stored_params(&self.store.read())
    }

    async fn update_node_params(&self, params: NodeParams) -> Result<(), AdminError> {
        self.modify_params(|p| p.put_node(params))
    }

    async fn update_storage_node_params(
        &self,
        params: StorageNodeParams,
    ) -> Result<(), AdminError> {
        self.modify_params(|p| p.put_storage_node(params))
    }

    async fn remove_node_params(&self, node: NodeId) -> Result<(), AdminError> {
        self.modify_params(|p| {
            p.remove_node(node);
        })
    }

    async fn metadata(&self, kind: MetadataKind) -> Result<Option<Metadata>, AdminError> {
        let store = self.store.read();
        match store.metadata.get(&kind) {
            Some(bytes) => Ok(Some(decode(bytes)?)),
            None => Ok(None),
        }
    }

    async fn save_metadata(&self, metadata: &Metadata) -> Result<(), AdminError> {
        let mut store = self.store.write();
        if let Some(bytes) = store.metadata.get(&metadata.kind()) {
            let stored: Metadata = decode(bytes)?;
            if metadata.sequence_number() < stored.sequence_number() {
                return Err(AdminError::StaleMetadata {
                    kind: metadata.kind().to_string(),
                    stored: stored.sequence_number(),
                    attempted: metadata.sequence_number(),
                });
            }
        }
        let bytes = encode(metadata)?;
        store.metadata.insert(metadata.kind(), bytes);
        store.metadata_saves += 1;
        Ok(())
    }

    async fn save_plan_record(&self, plan_id: u64, record: Vec<u8>) -> Result<(), AdminError> {
        self.store.write().plans.insert(plan_id, record);
        Ok(())
    }

    async fn load_plan_record(&self, plan_id: u64) -> Result<Option<Vec<u8>>, AdminError> {
        Ok(self.store.read().plans.get(&plan_id).cloned())
    }

    async fn plan_ids(&self) -> Result<Vec<u64>, AdminError> {
        Ok(self.store.read().plans.keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use kvplane_topology::{ShardId, StorageNode, StorageNodeId};

    #[tokio::test]
    async fn stale_topology_writes_are_rejected() {
        let mut topo = Topology::new("kvstore");
        let admin = MemoryAdmin::new(&topo, &Parameters::new()).unwrap();
        let old = topo.clone();

        topo.add_storage_node(StorageNode::new(StorageNodeId(1), "host1", 5000))
            .unwrap();
        topo.add_shard(ShardId(1)).unwrap();
        admin.save_topology(&topo).await.unwrap();

        assert_matches!(
            admin.save_topology(&old).await,
            Err(AdminError::StaleTopology {
                stored: 2,
                attempted: 0
            })
        );
        assert_eq!(admin.current_topology().await.unwrap(), topo);
        assert_eq!(admin.topology_saves(), 1);
    }
}
