//! Runs the steps of a plan

use std::sync::Arc;
use std::time::SystemTime;

use tracing::{error, info, warn};

use crate::cleanup::CleanupStatus;
use crate::config::ExecutorConfig;
use crate::context::PlanContext;
use crate::error::{CleanupHint, FaultKind, PlanError, PlanResult};
use crate::history::{FailureReport, PlanRun, TaskRun};
use crate::plan::PlanStep;
use crate::pool::WorkerPool;
use crate::state::{PlanState, TaskState};
use crate::task::{PlannedTask, Task};

/// Executes plan steps in order, fanning parallel steps out to a worker pool
#[derive(Debug, Clone)]
pub struct PlanExecutor {
    pool: WorkerPool,
}

struct Finished {
    task: PlannedTask,
    started_at: SystemTime,
    result: PlanResult<TaskState>,
}

impl PlanExecutor {
    /// Create an executor
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            pool: WorkerPool::new(config.pool_size),
        }
    }

    /// The worker pool used for parallel steps
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Run `steps` as execution number `attempt` of the plan in `ctx`.
    ///
    /// The run stops at the first failing task unless it continues past
    /// errors, and at the first interrupted task. Cleanup runs before the run
    /// ends.
    pub async fn run(&self, ctx: &PlanContext, steps: &[PlanStep], attempt: u32) -> PlanRun {
        let mut run = PlanRun::start(attempt);
        info!(
            "Executing plan {} ({}), attempt {}",
            ctx.plan_id(),
            ctx.plan_name(),
            attempt
        );

        for step in steps {
            if ctx.is_interrupted() {
                info!("Plan {} interrupted between steps", ctx.plan_id());
                run.finish(PlanState::Interrupted, None);
                return run;
            }

            let finished = self.run_step(ctx, step).await;

            let mut stop = None;
            for done in finished {
                let task_run = settle(ctx, &done).await;
                if stop.is_none() {
                    match task_run.state {
                        TaskState::Succeeded => {}
                        TaskState::Interrupted => {
                            stop = Some((PlanState::Interrupted, FailureReport::from_task_run(&task_run)));
                        }
                        _ if done.task.continue_past_error() => {
                            warn!(
                                "Plan {}: {} failed, continuing: {}",
                                ctx.plan_id(),
                                task_run.task,
                                task_run.message.as_deref().unwrap_or("no message")
                            );
                        }
                        _ => {
                            stop = Some((PlanState::Error, FailureReport::from_task_run(&task_run)));
                        }
                    }
                }
                run.task_runs.push(task_run);
            }

            if let Some((outcome, failure)) = stop {
                info!(
                    "Plan {} ended {} at {}: {}",
                    ctx.plan_id(),
                    outcome,
                    failure.task,
                    failure.message
                );
                run.finish(outcome, Some(failure));
                return run;
            }
        }

        info!("Plan {} succeeded", ctx.plan_id());
        run.finish(PlanState::Succeeded, None);
        run
    }

    async fn run_step(&self, ctx: &PlanContext, step: &PlanStep) -> Vec<Finished> {
        match step {
            PlanStep::Single(task) => {
                let started_at = SystemTime::now();
                info!("Plan {}: running {}", ctx.plan_id(), task.name());
                let result = task.execute(ctx).await;
                vec![Finished {
                    task: task.clone(),
                    started_at,
                    result,
                }]
            }
            PlanStep::Parallel(tasks) => {
                info!("Plan {}: running {} tasks in parallel", ctx.plan_id(), tasks.len());
                let jobs: Vec<Arc<dyn Task>> = tasks
                    .iter()
                    .map(|t| Arc::new(t.clone()) as Arc<dyn Task>)
                    .collect();
                self.pool
                    .run_all(ctx, jobs)
                    .await
                    .into_iter()
                    .zip(tasks)
                    .map(|(report, task)| Finished {
                        task: task.clone(),
                        started_at: report.started_at,
                        result: report.result,
                    })
                    .collect()
            }
        }
    }
}

/// Turn a task result into a run record, running cleanup when needed
async fn settle(ctx: &PlanContext, done: &Finished) -> TaskRun {
    let name = done.task.name();
    let (state, fault, message) = match &done.result {
        Ok(TaskState::Succeeded) => (TaskState::Succeeded, None, None),
        Ok(TaskState::Interrupted) => (TaskState::Interrupted, Some(FaultKind::Interrupted), None),
        Ok(other) => {
            let err = PlanError::internal(format!("task ended in state {other}"));
            (TaskState::Error, Some(err.kind()), Some(err.to_string()))
        }
        Err(e) if e.kind() == FaultKind::Interrupted => {
            (TaskState::Interrupted, Some(FaultKind::Interrupted), Some(e.to_string()))
        }
        Err(e) => {
            error!("Plan {}: {} failed: {}", ctx.plan_id(), name, e);
            (TaskState::Error, Some(e.kind()), Some(e.to_string()))
        }
    };

    let needs_cleanup = state != TaskState::Succeeded
        && fault.is_some_and(|f| f.cleanup_hint() == CleanupHint::RepairTopology);
    let cleanup = match done.task.cleanup_job() {
        Some(job) if needs_cleanup => {
            info!("Plan {}: running cleanup {} for {}", ctx.plan_id(), job, name);
            job.run(&ctx.for_cleanup()).await
        }
        _ => CleanupStatus::NotNeeded,
    };

    TaskRun {
        task: name,
        state,
        started_at: done.started_at,
        ended_at: SystemTime::now(),
        fault,
        message,
        cleanup,
    }
}
