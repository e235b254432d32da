//! Task and plan states

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PlanError, PlanResult};

/// Outcome state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Not run yet
    Pending,
    /// Running
    Running,
    /// Completed its work
    Succeeded,
    /// Failed
    Error,
    /// Stopped early because the plan was interrupted
    Interrupted,
}

impl TaskState {
    /// Whether the task has finished running
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Error | TaskState::Interrupted
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Lifecycle state of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlanState {
    /// Created, waiting for approval
    Pending,
    /// Approved for execution
    Approved,
    /// Executing
    Running,
    /// Every task succeeded
    Succeeded,
    /// Interrupted by request; may be executed again
    Interrupted,
    /// A task failed; may be executed again
    Error,
    /// Canceled; final
    Canceled,
}

impl PlanState {
    /// Whether a plan may move from this state to `next`
    pub fn can_transition_to(self, next: PlanState) -> bool {
        use PlanState::*;
        matches!(
            (self, next),
            (Pending, Approved | Canceled)
                | (Approved, Running | Canceled)
                | (Running, Succeeded | Interrupted | Error)
                | (Interrupted | Error, Running | Canceled)
        )
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow
    pub fn transition(&mut self, next: PlanState) -> PlanResult<()> {
        if !self.can_transition_to(next) {
            return Err(PlanError::invalid_state(format!(
                "plan cannot move from {self} to {next}"
            )));
        }
        *self = next;
        Ok(())
    }

    /// Whether no further transition is possible
    pub fn is_final(self) -> bool {
        matches!(self, PlanState::Succeeded | PlanState::Canceled)
    }

    /// Whether the plan may be executed from this state
    pub fn is_executable(self) -> bool {
        self.can_transition_to(PlanState::Running)
    }
}

impl fmt::Display for PlanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}
