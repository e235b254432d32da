//! Best-effort cleanup after a failed or interrupted task

use std::fmt;

use kvplane_topology::NodeId;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::context::PlanContext;
use crate::error::{FaultKind, PlanResult};
use crate::remedy;

/// Repair procedure attached to a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanupJob {
    /// Diagnose the node and apply the resulting remedy
    RepairNode(NodeId),
    /// Clear the node's disabled flag and start it
    ReenableNode(NodeId),
}

impl fmt::Display for CleanupJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupJob::RepairNode(node) => write!(f, "RepairNode({node})"),
            CleanupJob::ReenableNode(node) => write!(f, "ReenableNode({node})"),
        }
    }
}

/// How cleanup ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanupStatus {
    /// The task had no cleanup job, or the fault needed none
    NotNeeded,
    /// Cleanup converged
    Completed,
    /// Cleanup was interrupted before converging
    Pending,
    /// Cleanup gave up after the configured number of attempts
    Exhausted,
    /// Cleanup stopped on an unexpected error
    Aborted,
}

impl CleanupJob {
    async fn attempt(&self, ctx: &PlanContext) -> PlanResult<bool> {
        match self {
            CleanupJob::RepairNode(node) => {
                let remedy = remedy::diagnose(ctx, *node).await?;
                info!("Remedy for {}: {:?}", node, remedy);
                remedy::apply(ctx, &remedy).await
            }
            CleanupJob::ReenableNode(node) => remedy::reenable(ctx, *node).await,
        }
    }

    /// Run the job until it converges, is interrupted or runs out of attempts.
    ///
    /// `ctx` should come from [`PlanContext::for_cleanup`]. Errors never escape;
    /// transient remote failures are retried and anything else stops the job.
    pub async fn run(&self, ctx: &PlanContext) -> CleanupStatus {
        let config = &ctx.config().cleanup;
        let attempts = config.max_attempts.max(1);
        for attempt in 1..=attempts {
            if ctx.is_interrupted() {
                info!("Cleanup {} interrupted", self);
                return CleanupStatus::Pending;
            }
            match self.attempt(ctx).await {
                Ok(true) => {
                    info!("Cleanup {} completed", self);
                    return CleanupStatus::Completed;
                }
                Ok(false) => {
                    info!("Cleanup {} not done (attempt {}/{})", self, attempt, attempts);
                }
                Err(e) if e.kind() == FaultKind::Remote => {
                    warn!("Cleanup {} failed (attempt {}/{}): {}", self, attempt, attempts, e);
                }
                Err(e) => {
                    error!("Cleanup {} aborted: {}", self, e);
                    return CleanupStatus::Aborted;
                }
            }
            if attempt < attempts && !ctx.sleep(config.retry_delay).await {
                info!("Cleanup {} interrupted", self);
                return CleanupStatus::Pending;
            }
        }
        warn!("Cleanup {} gave up after {} attempts", self, attempts);
        CleanupStatus::Exhausted
    }
}
