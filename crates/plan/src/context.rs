//! Per-plan execution context handed to tasks and protocols

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kvplane_admin::{
    Admin, LoginContext, Monitor, NodeAdmin, NodeRegistry, NoopMonitor, RemoteCallError,
    RemoteResult, StorageNodeAgent,
};
use kvplane_topology::{NodeId, StorageNodeId};
use tokio_util::sync::CancellationToken;

use crate::config::PlanConfig;
use crate::error::PlanResult;
use crate::fault::{FaultInjector, FaultPoint, NoFaults};

/// Everything a running task needs: collaborators, configuration and the
/// interrupt flags of its plan.
///
/// Cheap to clone; clones share the same collaborators and flags.
#[derive(Clone)]
pub struct PlanContext {
    plan_id: u64,
    plan_name: Arc<str>,
    admin: Arc<dyn Admin>,
    registry: Arc<dyn NodeRegistry>,
    monitor: Arc<dyn Monitor>,
    login: LoginContext,
    config: Arc<PlanConfig>,
    faults: Arc<dyn FaultInjector>,
    interrupt: CancellationToken,
    cleanup_interrupt: CancellationToken,
}

impl PlanContext {
    /// Create a context with default configuration, no monitor and no faults
    pub fn new(
        plan_id: u64,
        plan_name: impl Into<Arc<str>>,
        admin: Arc<dyn Admin>,
        registry: Arc<dyn NodeRegistry>,
    ) -> Self {
        Self {
            plan_id,
            plan_name: plan_name.into(),
            admin,
            registry,
            monitor: Arc::new(NoopMonitor),
            login: LoginContext::anonymous(),
            config: Arc::new(PlanConfig::default()),
            faults: Arc::new(NoFaults),
            interrupt: CancellationToken::new(),
            cleanup_interrupt: CancellationToken::new(),
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

    /// Use a configuration
    pub fn with_config(mut self, config: Arc<PlanConfig>) -> Self {
        self.config = config;
        self
    }

    /// Use a fault injector
    pub fn with_faults(mut self, faults: Arc<dyn FaultInjector>) -> Self {
        self.faults = faults;
        self
    }

    /// Use externally owned interrupt flags
    pub fn with_interrupts(
        mut self,
        interrupt: CancellationToken,
        cleanup_interrupt: CancellationToken,
    ) -> Self {
        self.interrupt = interrupt;
        self.cleanup_interrupt = cleanup_interrupt;
        self
    }

    /// A context for cleanup jobs.
    ///
    /// The plan interrupt is usually already set when cleanup runs, so the
    /// cleanup interrupt takes its place.
    pub fn for_cleanup(&self) -> Self {
        let mut ctx = self.clone();
        ctx.interrupt = self.cleanup_interrupt.clone();
        ctx
    }

    /// Id of the running plan
    pub fn plan_id(&self) -> u64 {
        self.plan_id
    }

    /// Name of the running plan
    pub fn plan_name(&self) -> &str {
        &self.plan_name
    }

    /// The admin store
    pub fn admin(&self) -> &dyn Admin {
        self.admin.as_ref()
    }

    /// The node registry
    pub fn registry(&self) -> &dyn NodeRegistry {
        self.registry.as_ref()
    }

    /// The monitor
    pub fn monitor(&self) -> &dyn Monitor {
        self.monitor.as_ref()
    }

    /// Login credentials
    pub fn login(&self) -> &LoginContext {
        &self.login
    }

    /// Configuration
    pub fn config(&self) -> &PlanConfig {
        &self.config
    }

    /// Request an interrupt
    pub fn interrupt(&self) {
        self.interrupt.cancel();
    }

    /// Whether an interrupt was requested
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    /// Whether cleanup was asked to stop
    pub fn is_cleanup_interrupted(&self) -> bool {
        self.cleanup_interrupt.is_cancelled()
    }

    /// Sleep for `delay`, waking early on interrupt.
    ///
    /// Returns `false` if interrupted before or during the sleep.
    pub async fn sleep(&self, delay: Duration) -> bool {
        if self.interrupt.is_cancelled() {
            return false;
        }
        tokio::select! {
            () = tokio::time::sleep(delay) => true,
            () = self.interrupt.cancelled() => false,
        }
    }

    /// Fail if a fault is scheduled at this point
    pub fn fault(&self, point: FaultPoint, task: &str) -> PlanResult<()> {
        self.faults.check(point, task)
    }

    /// Run a remote call, bounded by the configured RPC timeout
    pub async fn call<T, F>(&self, fut: F) -> RemoteResult<T>
    where
        F: Future<Output = RemoteResult<T>>,
    {
        match tokio::time::timeout(self.config.rpc_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(RemoteCallError::unreachable(format!(
                "no answer within {:?}",
                self.config.rpc_timeout
            ))),
        }
    }

    /// Resolve a node's admin endpoint
    pub async fn node_admin(&self, node: NodeId) -> RemoteResult<Arc<dyn NodeAdmin>> {
        self.call(self.registry.node_admin(node, &self.login)).await
    }

    /// Resolve a storage node agent
    pub async fn agent(&self, sn: StorageNodeId) -> RemoteResult<Arc<dyn StorageNodeAgent>> {
        self.call(self.registry.storage_node_agent(sn, &self.login))
            .await
    }
}
