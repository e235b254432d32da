//! Monitor recording every hint it receives

use std::sync::Arc;

use kvplane_admin::Monitor;
use kvplane_topology::ComponentId;
use parking_lot::Mutex;

/// A hint received by a [`RecordingMonitor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    /// `register`
    Register(ComponentId),
    /// `unregister`
    Unregister(ComponentId),
    /// `collect_now`
    CollectNow(ComponentId),
}

/// Monitor that keeps the hints it receives, in order
#[derive(Debug, Clone, Default)]
pub struct RecordingMonitor {
    events: Arc<Mutex<Vec<MonitorEvent>>>,
}

impl RecordingMonitor {
    /// Create an empty monitor
    pub fn new() -> Self {
        Self::default()
    }

    /// Every hint received so far
    pub fn events(&self) -> Vec<MonitorEvent> {
        self.events.lock().clone()
    }

    /// Whether a component is currently registered
    pub fn is_registered(&self, component: ComponentId) -> bool {
        let mut registered = false;
        for event in self.events.lock().iter() {
            match event {
                MonitorEvent::Register(c) if *c == component => registered = true,
                MonitorEvent::Unregister(c) if *c == component => registered = false,
                _ => {}
            }
        }
        registered
    }
}

impl Monitor for RecordingMonitor {
    fn register(&self, component: ComponentId) {
        self.events.lock().push(MonitorEvent::Register(component));
    }

    fn unregister(&self, component: ComponentId) {
        self.events.lock().push(MonitorEvent::Unregister(component));
    }

    fn collect_now(&self, component: ComponentId) {
        self.events.lock().push(MonitorEvent::CollectNow(component));
    }
}
