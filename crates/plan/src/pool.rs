//! Bounded worker pool for parallel plan steps
//!
//! Each task runs as a resubmittable job. A job holds a pool permit only while
//! one of its steps runs; a job that is not done yet gives the permit back
//! while it waits for its next step.

use std::sync::Arc;
use std::time::{Instant, SystemTime};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::context::PlanContext;
use crate::error::{PlanError, PlanResult};
use crate::state::TaskState;
use crate::task::{NextJob, Task};

/// Outcome of one job
#[derive(Debug)]
pub struct JobReport {
    /// Position of the task in the submitted list
    pub index: usize,
    /// When the first step started
    pub started_at: SystemTime,
    /// When the job finished
    pub ended_at: SystemTime,
    /// Final result
    pub result: PlanResult<TaskState>,
}

/// Worker pool bounded by a semaphore
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Create a pool running at most `size` steps at once
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Pool size
    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits not currently held by a running step
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run every task to completion and join them.
    ///
    /// Reports come back in submission order.
    pub async fn run_all(&self, ctx: &PlanContext, tasks: Vec<Arc<dyn Task>>) -> Vec<JobReport> {
        let submitted_at = SystemTime::now();
        let count = tasks.len();
        let mut jobs = JoinSet::new();

        for (index, task) in tasks.into_iter().enumerate() {
            let permits = self.permits.clone();
            let ctx = ctx.clone();
            jobs.spawn(async move {
                let started_at = SystemTime::now();
                let result = run_job(&permits, &ctx, task.as_ref()).await;
                JobReport {
                    index,
                    started_at,
                    ended_at: SystemTime::now(),
                    result,
                }
            });
        }

        let mut reports: Vec<Option<JobReport>> = (0..count).map(|_| None).collect();
        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok(report) => {
                    let index = report.index;
                    reports[index] = Some(report);
                }
                Err(e) => error!("Worker pool job failed: {}", e),
            }
        }

        reports
            .into_iter()
            .enumerate()
            .map(|(index, report)| {
                report.unwrap_or_else(|| JobReport {
                    index,
                    started_at: submitted_at,
                    ended_at: SystemTime::now(),
                    result: Err(PlanError::internal("job did not complete")),
                })
            })
            .collect()
    }
}

async fn run_job(
    permits: &Semaphore,
    ctx: &PlanContext,
    task: &dyn Task,
) -> PlanResult<TaskState> {
    let started = Instant::now();
    loop {
        let permit = permits
            .acquire()
            .await
            .map_err(|_| PlanError::internal("worker pool closed"))?;
        if ctx.is_interrupted() {
            return Ok(TaskState::Interrupted);
        }
        let next = task.step(ctx, started).await;
        drop(permit);

        match next? {
            NextJob::Done(state) => return Ok(state),
            NextJob::RetryAfter(delay) => {
                debug!("{} not done, next step in {:?}", task.name(), delay);
                if !ctx.sleep(delay).await {
                    return Ok(TaskState::Interrupted);
                }
            }
        }
    }
}
