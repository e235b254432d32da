//! Plans: ordered lists of tasks with a lifecycle and a run history

use std::collections::BTreeSet;

use kvplane_topology::{ComponentId, Persisted};
use serde::{Deserialize, Serialize};

use crate::error::PlanResult;
use crate::history::{FailureReport, PlanRun};
use crate::state::PlanState;
use crate::task::{PlannedTask, Task, TaskKind};

/// One step of a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanStep {
    /// A task run on the executing task
    Single(PlannedTask),
    /// Independent tasks run on the worker pool and joined
    Parallel(Vec<PlannedTask>),
}

impl PlanStep {
    /// A single task that ends the plan when it fails
    pub fn task(kind: TaskKind) -> Self {
        PlanStep::Single(PlannedTask::new(kind))
    }

    /// A single task whose failure is logged and skipped
    pub fn lenient(kind: TaskKind) -> Self {
        PlanStep::Single(PlannedTask::lenient(kind))
    }

    /// Independent tasks run in parallel
    pub fn parallel(kinds: impl IntoIterator<Item = TaskKind>) -> Self {
        PlanStep::Parallel(kinds.into_iter().map(PlannedTask::new).collect())
    }

    /// Tasks of this step
    pub fn tasks(&self) -> &[PlannedTask] {
        match self {
            PlanStep::Single(task) => std::slice::from_ref(task),
            PlanStep::Parallel(tasks) => tasks,
        }
    }
}

/// A named, persisted list of steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    id: u64,
    name: String,
    steps: Vec<PlanStep>,
    state: PlanState,
    #[serde(default)]
    runs: Vec<PlanRun>,
}

impl Plan {
    /// Create a pending plan
    pub fn new(id: u64, name: impl Into<String>, steps: Vec<PlanStep>) -> Self {
        Self {
            id,
            name: name.into(),
            steps,
            state: PlanState::Pending,
            runs: Vec::new(),
        }
    }

    /// Plan id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Plan name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Steps in execution order
    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    /// Every task of the plan, in order
    pub fn tasks(&self) -> impl Iterator<Item = &PlannedTask> {
        self.steps.iter().flat_map(PlanStep::tasks)
    }

    /// Lifecycle state
    pub fn state(&self) -> PlanState {
        self.state
    }

    /// Past executions
    pub fn runs(&self) -> &[PlanRun] {
        &self.runs
    }

    /// Most recent execution
    pub fn last_run(&self) -> Option<&PlanRun> {
        self.runs.last()
    }

    /// Why the most recent execution did not succeed
    pub fn failure_report(&self) -> Option<&FailureReport> {
        self.last_run().and_then(|run| run.failure.as_ref())
    }

    /// Components reserved while the plan runs
    pub fn lock_components(&self) -> BTreeSet<ComponentId> {
        self.tasks().flat_map(Task::lock_components).collect()
    }

    /// Whether the plan holds a task with the same effect as `kind`
    pub fn contains_equivalent(&self, kind: &TaskKind) -> bool {
        self.tasks().any(|t| t.kind.logical_eq(kind))
    }

    /// Move to a new lifecycle state
    pub fn transition(&mut self, next: PlanState) -> PlanResult<()> {
        self.state.transition(next)
    }

    /// Start an execution, returning its attempt number
    pub fn begin_run(&mut self) -> PlanResult<u32> {
        self.state.transition(PlanState::Running)?;
        Ok(u32::try_from(self.runs.len()).unwrap_or(u32::MAX).saturating_add(1))
    }

    /// Record a finished execution and move to its outcome
    pub fn finish_run(&mut self, run: PlanRun) -> PlanResult<()> {
        self.state.transition(run.outcome)?;
        self.runs.push(run);
        Ok(())
    }

    /// Mark a plan found running after a restart as interrupted
    pub fn mark_abandoned(&mut self) -> PlanResult<()> {
        let attempt = u32::try_from(self.runs.len()).unwrap_or(u32::MAX).saturating_add(1);
        let mut run = PlanRun::start(attempt);
        run.finish(PlanState::Interrupted, None);
        self.finish_run(run)
    }
}

impl Persisted for Plan {
    const SCHEMA: &'static str = "plan";
    const VERSION: u16 = 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{AddNode, BroadcastTopology, RemoveNode};
    use kvplane_topology::codec::{decode, encode};
    use kvplane_topology::{NodeId, ShardId, StorageNodeId};

    fn add_node() -> TaskKind {
        TaskKind::AddNode(AddNode {
            node: NodeId::data(1, 4),
            storage_node: StorageNodeId(4),
            ha_host_port: "host4:5011".to_string(),
        })
    }

    #[test]
    fn lock_components_cover_every_step() {
        let plan = Plan::new(
            1,
            "grow",
            vec![
                PlanStep::task(add_node()),
                PlanStep::parallel([TaskKind::RemoveNode(RemoveNode {
                    node: NodeId::data(2, 1),
                })]),
                PlanStep::task(TaskKind::BroadcastTopology(BroadcastTopology)),
            ],
        );

        let locks = plan.lock_components();
        assert!(locks.contains(&ComponentId::Shard(ShardId(1))));
        assert!(locks.contains(&ComponentId::Node(NodeId::data(1, 4))));
        assert!(locks.contains(&ComponentId::Node(NodeId::data(2, 1))));
        assert_eq!(locks.len(), 4);
        assert!(plan.contains_equivalent(&add_node()));
    }

    #[test]
    fn plan_record_survives_the_codec() {
        let mut plan = Plan::new(7, "grow", vec![PlanStep::lenient(add_node())]);
        plan.transition(PlanState::Approved).unwrap();
        let attempt = plan.begin_run().unwrap();
        let mut run = PlanRun::start(attempt);
        run.finish(PlanState::Succeeded, None);
        plan.finish_run(run).unwrap();

        let decoded: Plan = decode(&encode(&plan).unwrap()).unwrap();
        assert_eq!(decoded, plan);
        assert_eq!(decoded.runs()[0].attempt, 1);
        assert!(decoded.tasks().all(|t| t.continue_past_error));
    }
}
