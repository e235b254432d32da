//! Plans and tasks for the kvplane control plane
//!
//! This crate provides:
//! - Idempotent [`Task`]s that change the topology, node services and
//!   store metadata
//! - [`Plan`]s composing tasks, run by the [`PlanExecutor`] on a bounded
//!   [`WorkerPool`]
//! - The broadcast, membership and quorum protocols tasks are built on
//! - Topology repair: remedies and cleanup jobs
//! - The [`Planner`]: admission, execution and durable plan records
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod broadcast;
pub mod cleanup;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod fault;
pub mod health;
pub mod history;
pub mod membership;
pub mod plan;
pub mod planner;
pub mod pool;
pub mod remedy;
pub mod state;
pub mod task;

pub use cleanup::{CleanupJob, CleanupStatus};
pub use config::{
    BroadcastConfig, CleanupConfig, ExecutorConfig, HealthConfig, MembershipConfig, PlanConfig,
};
pub use context::PlanContext;
pub use error::{CleanupHint, ErrorContext, FaultKind, PlanError, PlanResult};
pub use executor::PlanExecutor;
pub use fault::{FaultInjector, FaultPoint, NoFaults, ScriptedFaults};
pub use history::{FailureReport, PlanRun, TaskRun};
pub use membership::LiveAddress;
pub use plan::{Plan, PlanStep};
pub use planner::Planner;
pub use pool::{JobReport, WorkerPool};
pub use remedy::Remedy;
pub use state::{PlanState, TaskState};
pub use task::{NextJob, PlannedTask, Task, TaskKind};
