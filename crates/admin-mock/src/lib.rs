//! In-memory doubles of the kvplane collaborators, for tests
//!
//! - [`MemoryAdmin`]: admin store holding encoded entities in memory
//! - [`MockCluster`]: scriptable storage node agents and shard members
//! - [`RecordingMonitor`]: monitor that records hints
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod admin;
pub mod cluster;
pub mod monitor;

pub use admin::MemoryAdmin;
pub use cluster::{MockCluster, NodeCalls};
pub use monitor::{MonitorEvent, RecordingMonitor};
