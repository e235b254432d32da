//! Error types for persistence and remote calls

use std::fmt;

use kvplane_topology::CodecError;
use thiserror::Error as ThisError;

/// Result type for remote calls
pub type RemoteResult<T> = Result<T, RemoteCallError>;

/// The kind of remote call failure.
///
/// Retry decisions are made on the kind alone.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RemoteCallErrorKind {
    /// The target could not be reached or did not answer in time
    Unreachable,

    /// The target answered and refused the request
    Rejected,

    /// Other/unknown error
    Other,
}

impl fmt::Display for RemoteCallErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Error returned by every remote call
#[derive(Clone, Debug, ThisError, Eq, PartialEq)]
#[error("{kind}: {message}")]
pub struct RemoteCallError {
    kind: RemoteCallErrorKind,
    message: String,
}

impl RemoteCallError {
    /// Create a new error
    pub fn new(kind: RemoteCallErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Create an unreachable error
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(RemoteCallErrorKind::Unreachable, message)
    }

    /// Create a rejected error
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(RemoteCallErrorKind::Rejected, message)
    }

    /// Create an error of unknown kind
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(RemoteCallErrorKind::Other, message)
    }

    /// Returns the kind of this error
    pub fn kind(&self) -> RemoteCallErrorKind {
        self.kind
    }

    /// Error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether retrying later may succeed
    pub fn is_transient(&self) -> bool {
        self.kind == RemoteCallErrorKind::Unreachable
    }
}

/// Errors raised by the admin persistence layer
#[derive(Debug, ThisError)]
pub enum AdminError {
    /// Write would replace a newer topology
    #[error("stale topology write: stored sequence {stored}, attempted {attempted}")]
    StaleTopology {
        /// Sequence number currently stored
        stored: u64,
        /// Sequence number of the rejected write
        attempted: u64,
    },

    /// Write would replace newer metadata
    #[error("stale {kind} metadata write: stored sequence {stored}, attempted {attempted}")]
    StaleMetadata {
        /// Metadata kind
        kind: String,
        /// Sequence number currently stored
        stored: u64,
        /// Sequence number of the rejected write
        attempted: u64,
    },

    /// Persisted bytes could not be read or written
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Underlying store failure
    #[error("storage error: {0}")]
    Storage(String),
}
