//! Cluster topology and store metadata for the kvplane control plane
//!
//! This crate provides:
//! - Component identifiers and types (storage nodes, shards, nodes, partitions)
//! - The versioned [`Topology`] with its change log
//! - Versioned schema and security [`Metadata`]
//! - Authoritative component [`Parameters`]
//! - The versioned persistence codec
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod codec;
pub mod error;
pub mod ids;
pub mod metadata;
pub mod node;
pub mod params;
pub mod topology;

pub use codec::Persisted;
pub use error::{CodecError, TopologyError, TopologyResult};
pub use ids::{ComponentId, NodeId, NodeKind, PartitionId, ShardId, StorageNodeId};
pub use metadata::{
    ChangeInfo, FieldDef, Metadata, MetadataChange, MetadataEntry, MetadataKind, MetadataOp,
    TableDef, UserDef,
};
pub use node::{Component, Node, Partition, ReplicationGroup, StorageNode};
pub use params::{NodeParams, Parameters, StorageNodeParams};
pub use topology::{ChangeOp, EMPTY_SEQUENCE_NUMBER, Topology, TopologyChange};
