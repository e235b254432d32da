//! Records of plan executions

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::cleanup::CleanupStatus;
use crate::error::FaultKind;
use crate::state::{PlanState, TaskState};

/// One execution of one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRun {
    /// Task name
    pub task: String,
    /// Final state
    pub state: TaskState,
    /// When the task started
    pub started_at: SystemTime,
    /// When the task ended, cleanup included
    pub ended_at: SystemTime,
    /// Fault that ended the task, if any
    pub fault: Option<FaultKind>,
    /// Error message, if any
    pub message: Option<String>,
    /// What cleanup did
    pub cleanup: CleanupStatus,
}

/// Why a plan run did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    /// Failing task
    pub task: String,
    /// Fault kind
    pub fault: FaultKind,
    /// Error message
    pub message: String,
    /// What cleanup did
    pub cleanup: CleanupStatus,
}

impl FailureReport {
    /// Build a report from a failed or interrupted task run
    pub fn from_task_run(run: &TaskRun) -> Self {
        Self {
            task: run.task.clone(),
            fault: run.fault.unwrap_or(FaultKind::Internal),
            message: run
                .message
                .clone()
                .unwrap_or_else(|| run.state.to_string()),
            cleanup: run.cleanup,
        }
    }
}

/// One execution of a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanRun {
    /// Execution number, starting at 1
    pub attempt: u32,
    /// When the run started
    pub started_at: SystemTime,
    /// When the run ended
    pub ended_at: Option<SystemTime>,
    /// Task executions, in completion order
    pub task_runs: Vec<TaskRun>,
    /// State the plan ended the run in
    pub outcome: PlanState,
    /// Why the run did not succeed
    pub failure: Option<FailureReport>,
}

impl PlanRun {
    /// Start a run
    pub fn start(attempt: u32) -> Self {
        Self {
            attempt,
            started_at: SystemTime::now(),
            ended_at: None,
            task_runs: Vec::new(),
            outcome: PlanState::Running,
            failure: None,
        }
    }

    /// End the run
    pub fn finish(&mut self, outcome: PlanState, failure: Option<FailureReport>) {
        self.ended_at = Some(SystemTime::now());
        self.outcome = outcome;
        self.failure = failure;
    }

    /// Runs of a task, by name
    pub fn task_run(&self, task: &str) -> Option<&TaskRun> {
        self.task_runs.iter().find(|r| r.task == task)
    }
}
