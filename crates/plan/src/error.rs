//! Error types for plans and tasks

use std::fmt;

use kvplane_admin::{AdminError, RemoteCallError};
use kvplane_topology::{CodecError, ComponentId, TopologyError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for plan operations
pub type PlanResult<T> = Result<T, PlanError>;

/// Main error type for plan execution
#[derive(Debug, Error)]
pub struct PlanError {
    /// Fault kind
    kind: FaultKind,
    /// Error context
    context: ErrorContext,
}

impl PlanError {
    /// Create a new error
    pub fn new(kind: FaultKind, context: ErrorContext) -> Self {
        Self { kind, context }
    }

    /// Create error with string context
    pub fn with_context(kind: FaultKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: ErrorContext::Message(context.into()),
        }
    }

    /// Get fault kind
    pub fn kind(&self) -> FaultKind {
        self.kind
    }

    /// Get error context
    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// What a cleanup job should do after this fault
    pub fn cleanup_hint(&self) -> CleanupHint {
        self.kind.cleanup_hint()
    }

    /// Create a quorum fault
    pub fn quorum(msg: impl Into<String>) -> Self {
        Self::with_context(FaultKind::Quorum, msg)
    }

    /// Create an inconsistent state fault
    pub fn inconsistent(msg: impl Into<String>) -> Self {
        Self::with_context(FaultKind::Inconsistent, msg)
    }

    /// Create a remote fault
    pub fn remote(msg: impl Into<String>) -> Self {
        Self::with_context(FaultKind::Remote, msg)
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::with_context(FaultKind::InvalidState, msg)
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::with_context(FaultKind::Internal, msg)
    }

    /// Create a lock conflict error
    pub fn lock_conflict(component: ComponentId, owner: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::LockConflict,
            context: ErrorContext::Component {
                message: format!("locked by {}", owner.into()),
                component,
            },
        }
    }

    /// Create a not found error for a component
    pub fn not_found(component: ComponentId) -> Self {
        Self {
            kind: FaultKind::NotFound,
            context: ErrorContext::Component {
                message: "not found".to_string(),
                component,
            },
        }
    }

    /// Create a remote fault from a failed call
    pub fn remote_call(message: impl Into<String>, err: RemoteCallError) -> Self {
        Self {
            kind: FaultKind::Remote,
            context: ErrorContext::Chain {
                message: message.into(),
                source: Box::new(err),
            },
        }
    }
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            ErrorContext::Message(msg) => write!(f, "{}: {}", self.kind, msg),
            ErrorContext::Chain { message, source } => {
                write!(f, "{}: {} (caused by: {})", self.kind, message, source)
            }
            ErrorContext::Component { message, component } => {
                write!(f, "{}: {} {}", self.kind, component, message)
            }
        }
    }
}

/// Fault kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    /// A shard would lose, or has lost, its ability to elect a leader
    Quorum,
    /// Topology, parameters and live state disagree
    Inconsistent,
    /// A remote call failed
    Remote,
    /// The admin store failed
    Persistence,
    /// A component is reserved by another plan
    LockConflict,
    /// Persisted bytes could not be read or written
    Codec,
    /// Operation is not valid in the current state
    InvalidState,
    /// Component not found
    NotFound,
    /// The plan was interrupted
    Interrupted,
    /// Internal error
    Internal,
}

impl FaultKind {
    /// What a cleanup job should do after a fault of this kind
    pub fn cleanup_hint(self) -> CleanupHint {
        match self {
            FaultKind::Inconsistent
            | FaultKind::Remote
            | FaultKind::Persistence
            | FaultKind::Interrupted
            | FaultKind::Internal => CleanupHint::RepairTopology,
            FaultKind::Quorum
            | FaultKind::LockConflict
            | FaultKind::Codec
            | FaultKind::InvalidState
            | FaultKind::NotFound => CleanupHint::None,
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::Quorum => write!(f, "Quorum fault"),
            FaultKind::Inconsistent => write!(f, "Inconsistent state"),
            FaultKind::Remote => write!(f, "Remote call failed"),
            FaultKind::Persistence => write!(f, "Persistence error"),
            FaultKind::LockConflict => write!(f, "Lock conflict"),
            FaultKind::Codec => write!(f, "Codec error"),
            FaultKind::InvalidState => write!(f, "Invalid state"),
            FaultKind::NotFound => write!(f, "Not found"),
            FaultKind::Interrupted => write!(f, "Interrupted"),
            FaultKind::Internal => write!(f, "Internal error"),
        }
    }
}

/// Cleanup needed after a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanupHint {
    /// Nothing was mutated, or nothing can be repaired
    None,
    /// Bring topology, parameters and live state back in line
    RepairTopology,
}

/// Error context
#[derive(Debug)]
pub enum ErrorContext {
    /// Simple message
    Message(String),
    /// Error chain with source
    Chain {
        /// Error message
        message: String,
        /// Source error
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// Error about a specific component
    Component {
        /// Error message
        message: String,
        /// Component concerned
        component: ComponentId,
    },
}

// Conversion implementations for lower layer errors

impl From<TopologyError> for PlanError {
    fn from(err: TopologyError) -> Self {
        let kind = match &err {
            TopologyError::NotFound(_) => FaultKind::NotFound,
            TopologyError::AlreadyExists(_) | TopologyError::InvalidId(_) => {
                FaultKind::InvalidState
            }
            TopologyError::DanglingReference { .. } | TopologyError::ChangeGap { .. } => {
                FaultKind::Inconsistent
            }
            TopologyError::Other(_) => FaultKind::Internal,
        };
        Self {
            kind,
            context: ErrorContext::Chain {
                message: "topology error".to_string(),
                source: Box::new(err),
            },
        }
    }
}

impl From<CodecError> for PlanError {
    fn from(err: CodecError) -> Self {
        Self {
            kind: FaultKind::Codec,
            context: ErrorContext::Chain {
                message: "codec error".to_string(),
                source: Box::new(err),
            },
        }
    }
}

impl From<AdminError> for PlanError {
    fn from(err: AdminError) -> Self {
        let kind = match &err {
            AdminError::Codec(_) => FaultKind::Codec,
            AdminError::StaleTopology { .. } | AdminError::StaleMetadata { .. } => {
                FaultKind::Inconsistent
            }
            AdminError::Storage(_) => FaultKind::Persistence,
        };
        Self {
            kind,
            context: ErrorContext::Chain {
                message: "admin error".to_string(),
                source: Box::new(err),
            },
        }
    }
}

impl From<RemoteCallError> for PlanError {
    fn from(err: RemoteCallError) -> Self {
        Self::remote_call("remote call failed", err)
    }
}

impl From<kvplane_locks_memory::Error> for PlanError {
    fn from(err: kvplane_locks_memory::Error) -> Self {
        Self {
            kind: FaultKind::Internal,
            context: ErrorContext::Chain {
                message: "lock table error".to_string(),
                source: Box::new(err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvplane_topology::{NodeId, ShardId};

    #[test]
    fn topology_errors_map_to_fault_kinds() {
        let missing: PlanError =
            TopologyError::NotFound(ComponentId::Shard(ShardId(3))).into();
        assert_eq!(missing.kind(), FaultKind::NotFound);
        assert_eq!(missing.cleanup_hint(), CleanupHint::None);

        let gap: PlanError = TopologyError::ChangeGap {
            expected: 4,
            first: 6,
        }
        .into();
        assert_eq!(gap.kind(), FaultKind::Inconsistent);
        assert_eq!(gap.cleanup_hint(), CleanupHint::RepairTopology);
    }

    #[test]
    fn display_names_the_component() {
        let err = PlanError::lock_conflict(ComponentId::Node(NodeId::data(1, 2)), "plan-7");
        assert_eq!(err.to_string(), "Lock conflict: rg1-rn2 locked by plan-7");
    }
}
