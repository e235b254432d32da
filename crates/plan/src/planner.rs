//! Plan registry, admission and execution entry point

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use kvplane_admin::{Admin, LoginContext, Monitor, NodeRegistry, NoopMonitor};
use kvplane_locks::{LockManager, LockStatus};
use kvplane_locks_memory::{MemoryLockGuard, MemoryLockManager};
use kvplane_topology::ComponentId;
use kvplane_topology::codec::{decode, encode};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cleanup::CleanupStatus;
use crate::config::PlanConfig;
use crate::context::PlanContext;
use crate::error::{PlanError, PlanResult};
use crate::executor::PlanExecutor;
use crate::fault::{FaultInjector, NoFaults};
use crate::history::{FailureReport, PlanRun};
use crate::plan::{Plan, PlanStep};
use crate::state::PlanState;
use crate::task::Task;

struct PlanEntry {
    plan: Mutex<Plan>,
    interrupt: Mutex<CancellationToken>,
    cleanup_interrupt: Mutex<CancellationToken>,
}

impl PlanEntry {
    fn new(plan: Plan) -> Self {
        Self {
            plan: Mutex::new(plan),
            interrupt: Mutex::new(CancellationToken::new()),
            cleanup_interrupt: Mutex::new(CancellationToken::new()),
        }
    }
}

/// Creates, admits and executes plans.
///
/// Plans touching the same topology components cannot run at the same time:
/// each execution reserves the components of every task of its plan before
/// the first task runs, and gives them back when the run ends.
pub struct Planner {
    admin: Arc<dyn Admin>,
    registry: Arc<dyn NodeRegistry>,
    monitor: Arc<dyn Monitor>,
    login: LoginContext,
    config: Arc<PlanConfig>,
    faults: Arc<dyn FaultInjector>,
    locks: MemoryLockManager,
    plans: DashMap<u64, Arc<PlanEntry>>,
    next_id: AtomicU64,
    executor: PlanExecutor,
}

impl Planner {
    /// Create a planner
    pub fn new(admin: Arc<dyn Admin>, registry: Arc<dyn NodeRegistry>, config: PlanConfig) -> Self {
        let executor = PlanExecutor::new(&config.executor);
        Self {
            admin,
            registry,
            monitor: Arc::new(NoopMonitor),
            login: LoginContext::anonymous(),
            config: Arc::new(config),
            faults: Arc::new(NoFaults),
            locks: MemoryLockManager::new(),
            plans: DashMap::new(),
            next_id: AtomicU64::new(1),
            executor,
        }
    }

    /// Use a monitor
    pub fn with_monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Use login credentials
    pub fn with_login(mut self, login: LoginContext) -> Self {
        self.login = login;
        self
    }

    /// Use a fault injector
    pub fn with_faults(mut self, faults: Arc<dyn FaultInjector>) -> Self {
        self.faults = faults;
        self
    }

    /// Create and persist a pending plan.
    ///
    /// Refused when a plan that may still run already holds a task with the
    /// same effect.
    pub async fn create_plan(
        &self,
        name: impl Into<String>,
        steps: Vec<PlanStep>,
    ) -> PlanResult<u64> {
        let name = name.into();
        for entry in self.plans.iter() {
            let other = entry.plan.lock();
            if other.state().is_final() {
                continue;
            }
            let duplicate = steps
                .iter()
                .flat_map(PlanStep::tasks)
                .find(|t| other.contains_equivalent(&t.kind));
            if let Some(task) = duplicate {
                return Err(PlanError::invalid_state(format!(
                    "plan {} ({}) already holds {}",
                    other.id(),
                    other.name(),
                    task.name()
                )));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let plan = Plan::new(id, name, steps);
        self.persist(&plan).await?;
        info!("Created plan {} ({})", id, plan.name());
        self.plans.insert(id, Arc::new(PlanEntry::new(plan)));
        Ok(id)
    }

    /// Approve a pending plan
    pub async fn approve(&self, id: u64) -> PlanResult<()> {
        self.update(id, |plan| plan.transition(PlanState::Approved))
            .await
    }

    /// Cancel a plan that is not running
    pub async fn cancel(&self, id: u64) -> PlanResult<()> {
        self.update(id, |plan| plan.transition(PlanState::Canceled))
            .await?;
        info!("Canceled plan {}", id);
        Ok(())
    }

    /// Execute an approved, interrupted or failed plan and wait for it.
    ///
    /// Admission fails, leaving the plan untouched, when another plan holds
    /// one of its components. Returns the state the run ended in.
    pub async fn execute(&self, id: u64) -> PlanResult<PlanState> {
        let entry = self.entry(id)?;
        let (name, steps, components) = {
            let plan = entry.plan.lock();
            if !plan.state().is_executable() {
                return Err(PlanError::invalid_state(format!(
                    "plan {} is {} and cannot be executed",
                    id,
                    plan.state()
                )));
            }
            (
                plan.name().to_string(),
                plan.steps().to_vec(),
                plan.lock_components(),
            )
        };

        let guards = self.acquire_locks(id, &components).await?;

        let interrupt = CancellationToken::new();
        let cleanup_interrupt = CancellationToken::new();
        *entry.interrupt.lock() = interrupt.clone();
        *entry.cleanup_interrupt.lock() = cleanup_interrupt.clone();

        let (attempt, snapshot) = {
            let mut plan = entry.plan.lock();
            let attempt = plan.begin_run()?;
            (attempt, plan.clone())
        };
        if let Err(e) = self.persist(&snapshot).await {
            let mut run = PlanRun::start(attempt);
            run.finish(
                PlanState::Error,
                Some(FailureReport {
                    task: "save plan record".to_string(),
                    fault: e.kind(),
                    message: e.to_string(),
                    cleanup: CleanupStatus::NotNeeded,
                }),
            );
            entry.plan.lock().finish_run(run)?;
            return Err(e);
        }

        let ctx = PlanContext::new(id, name, self.admin.clone(), self.registry.clone())
            .with_monitor(self.monitor.clone())
            .with_login(self.login.clone())
            .with_config(self.config.clone())
            .with_faults(self.faults.clone())
            .with_interrupts(interrupt, cleanup_interrupt);

        let run = self.executor.run(&ctx, &steps, attempt).await;
        drop(guards);

        let outcome = run.outcome;
        let snapshot = {
            let mut plan = entry.plan.lock();
            plan.finish_run(run)?;
            plan.clone()
        };
        self.persist(&snapshot).await?;
        Ok(outcome)
    }

    /// Ask a running plan to stop between retries
    pub fn interrupt(&self, id: u64) -> PlanResult<()> {
        let entry = self.entry(id)?;
        info!("Interrupt requested for plan {}", id);
        entry.interrupt.lock().cancel();
        Ok(())
    }

    /// Ask the cleanup jobs of a plan to stop retrying
    pub fn interrupt_cleanup(&self, id: u64) -> PlanResult<()> {
        let entry = self.entry(id)?;
        info!("Cleanup interrupt requested for plan {}", id);
        entry.cleanup_interrupt.lock().cancel();
        Ok(())
    }

    /// Lifecycle state of a plan
    pub fn state(&self, id: u64) -> PlanResult<PlanState> {
        Ok(self.entry(id)?.plan.lock().state())
    }

    /// Snapshot of a plan
    pub fn plan(&self, id: u64) -> PlanResult<Plan> {
        Ok(self.entry(id)?.plan.lock().clone())
    }

    /// Why the latest execution of a plan did not succeed
    pub fn failure_report(&self, id: u64) -> PlanResult<Option<FailureReport>> {
        Ok(self.entry(id)?.plan.lock().failure_report().cloned())
    }

    /// Number of components currently reserved by running plans
    pub fn held_locks(&self) -> usize {
        self.locks.held()
    }

    /// Load persisted plans after a restart.
    ///
    /// A plan recorded as running did not end cleanly and is marked
    /// interrupted, so it can be executed again. Returns the number of plans
    /// loaded.
    pub async fn recover(&self) -> PlanResult<usize> {
        let mut loaded = 0;
        for id in self.admin.plan_ids().await? {
            let Some(record) = self.admin.load_plan_record(id).await? else {
                warn!("Plan {} is listed but has no record", id);
                continue;
            };
            let mut plan: Plan = decode(&record)?;
            if plan.state() == PlanState::Running {
                info!("Plan {} was running at shutdown, marking interrupted", id);
                plan.mark_abandoned()?;
                self.persist(&plan).await?;
            }
            self.next_id.fetch_max(id.saturating_add(1), Ordering::SeqCst);
            self.plans.insert(id, Arc::new(PlanEntry::new(plan)));
            loaded += 1;
        }
        debug!("Recovered {} plans", loaded);
        Ok(loaded)
    }

    fn entry(&self, id: u64) -> PlanResult<Arc<PlanEntry>> {
        self.plans
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| PlanError::invalid_state(format!("no plan with id {id}")))
    }

    async fn update(&self, id: u64, f: impl FnOnce(&mut Plan) -> PlanResult<()>) -> PlanResult<()> {
        let entry = self.entry(id)?;
        let snapshot = {
            let mut plan = entry.plan.lock();
            f(&mut plan)?;
            plan.clone()
        };
        self.persist(&snapshot).await
    }

    async fn persist(&self, plan: &Plan) -> PlanResult<()> {
        let record = encode(plan)?;
        self.admin.save_plan_record(plan.id(), record).await?;
        Ok(())
    }

    /// Reserve every component or none
    async fn acquire_locks(
        &self,
        id: u64,
        components: &BTreeSet<ComponentId>,
    ) -> PlanResult<Vec<MemoryLockGuard>> {
        let owner = format!("plan-{id}");
        let mut guards = Vec::with_capacity(components.len());
        for component in components {
            let key = component.to_string();
            match self.locks.try_lock(key.clone(), owner.clone()).await? {
                Some(guard) => guards.push(guard),
                None => {
                    let holder = match self.locks.check(key).await? {
                        LockStatus::HeldBy(holder) => holder,
                        LockStatus::Free => "a plan that just ended".to_string(),
                    };
                    warn!("Plan {} refused: {} is locked by {}", id, component, holder);
                    return Err(PlanError::lock_conflict(*component, holder));
                }
            }
        }
        debug!("Plan {} reserved {} components", id, guards.len());
        Ok(guards)
    }
}
