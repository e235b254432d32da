//! Fault injection points inside tasks

use std::fmt;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{FaultKind, PlanError, PlanResult};

/// Places inside task execution where a fault can be injected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// Before the task persists its changes
    BeforeSave,
    /// After the task persisted its changes
    AfterSave,
    /// After a node was stopped
    AfterStop,
    /// After the replication group accepted a membership change
    AfterMembershipChange,
    /// Before a broadcast starts
    BeforeBroadcast,
}

impl fmt::Display for FaultPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Decides whether execution fails at a fault point
pub trait FaultInjector: Send + Sync + 'static {
    /// Returns an error when a fault is scheduled for this point and task
    fn check(&self, point: FaultPoint, task: &str) -> PlanResult<()>;
}

/// Injector that never fails
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFaults;

impl FaultInjector for NoFaults {
    fn check(&self, _point: FaultPoint, _task: &str) -> PlanResult<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct ScriptedFault {
    point: FaultPoint,
    task_prefix: Option<String>,
    kind: FaultKind,
    remaining: usize,
}

/// Injector failing at scripted points a fixed number of times
#[derive(Debug, Default)]
pub struct ScriptedFaults {
    script: Mutex<Vec<ScriptedFault>>,
}

impl ScriptedFaults {
    /// Create an empty script
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail once at a point, in any task
    pub fn fail_once(self, point: FaultPoint, kind: FaultKind) -> Self {
        self.fail(point, None, kind, 1)
    }

    /// Fail `times` times at a point, in tasks whose name starts with `task_prefix`
    pub fn fail(
        self,
        point: FaultPoint,
        task_prefix: Option<&str>,
        kind: FaultKind,
        times: usize,
    ) -> Self {
        self.script.lock().push(ScriptedFault {
            point,
            task_prefix: task_prefix.map(str::to_string),
            kind,
            remaining: times,
        });
        self
    }

    /// Number of scripted faults not yet fired
    pub fn pending(&self) -> usize {
        self.script.lock().iter().map(|f| f.remaining).sum()
    }
}

impl FaultInjector for ScriptedFaults {
    fn check(&self, point: FaultPoint, task: &str) -> PlanResult<()> {
        let mut script = self.script.lock();
        let fault = script.iter_mut().find(|f| {
            f.remaining > 0
                && f.point == point
                && f.task_prefix.as_deref().is_none_or(|p| task.starts_with(p))
        });
        match fault {
            Some(fault) => {
                fault.remaining -= 1;
                warn!("Injecting {} at {} in {}", fault.kind, point, task);
                Err(PlanError::with_context(
                    fault.kind,
                    format!("injected at {point}"),
                ))
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_faults_fire_the_given_number_of_times() {
        let faults = ScriptedFaults::new().fail(
            FaultPoint::AfterSave,
            Some("AddNode"),
            FaultKind::Remote,
            2,
        );

        assert!(faults.check(FaultPoint::AfterSave, "RemoveNode(rg1-rn1)").is_ok());
        assert!(faults.check(FaultPoint::BeforeSave, "AddNode(rg1-rn1)").is_ok());
        let err = faults
            .check(FaultPoint::AfterSave, "AddNode(rg1-rn1)")
            .unwrap_err();
        assert_eq!(err.kind(), FaultKind::Remote);
        assert!(faults.check(FaultPoint::AfterSave, "AddNode(rg1-rn1)").is_err());
        assert!(faults.check(FaultPoint::AfterSave, "AddNode(rg1-rn1)").is_ok());
        assert_eq!(faults.pending(), 0);
    }
}
