//! Contracts of the collaborators the kvplane control plane drives
//!
//! This crate provides:
//! - The [`Admin`] persistence handle
//! - Remote control interfaces for storage node agents and shard members
//! - The [`NodeRegistry`] that resolves them
//! - Login context and the [`Monitor`] sink
//! - [`RemoteCallError`], the single error type of every remote call
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod admin;
pub mod error;
pub mod login;
pub mod monitor;
pub mod remote;

pub use admin::Admin;
pub use error::{AdminError, RemoteCallError, RemoteCallErrorKind, RemoteResult};
pub use login::LoginContext;
pub use monitor::{Monitor, NoopMonitor};
pub use remote::{
    MemberAddress, MembershipReply, MetadataUpdate, NodeAdmin, NodeRegistry, NodeStatus,
    ReplicaRole, ServiceState, StorageNodeAgent, TopologyUpdate,
};
