//! Status collection sink

use kvplane_topology::ComponentId;

/// Receives hints about components whose status should be collected.
///
/// Calls are fire-and-forget.
pub trait Monitor: Send + Sync + 'static {
    /// Start collecting status for a component
    fn register(&self, component: ComponentId);

    /// Stop collecting status for a component
    fn unregister(&self, component: ComponentId);

    /// Collect status now, after a state-changing operation
    fn collect_now(&self, component: ComponentId);
}

/// Monitor that ignores every hint
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMonitor;

impl Monitor for NoopMonitor {
    fn register(&self, _component: ComponentId) {}

    fn unregister(&self, _component: ComponentId) {}

    fn collect_now(&self, _component: ComponentId) {}
}
