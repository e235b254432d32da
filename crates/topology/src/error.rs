//! Error types for topology, metadata and codec operations

use thiserror::Error as ThisError;

use crate::ComponentId;

/// Result type for topology operations
pub type TopologyResult<T> = Result<T, TopologyError>;

/// Topology-related errors
#[derive(Clone, Debug, ThisError, PartialEq, Eq)]
pub enum TopologyError {
    /// Component is not part of the topology
    #[error("component {0} not found in topology")]
    NotFound(ComponentId),

    /// Component already exists with different contents
    #[error("component {0} already exists")]
    AlreadyExists(ComponentId),

    /// A referenced component is missing
    #[error("{component} references missing {missing}")]
    DanglingReference {
        /// Component holding the reference
        component: ComponentId,
        /// The component that is missing
        missing: ComponentId,
    },

    /// A change list does not continue from the current sequence number
    #[error("change list starts at {first}, expected {expected}")]
    ChangeGap {
        /// Expected first sequence number
        expected: u64,
        /// Sequence number of the first supplied change
        first: u64,
    },

    /// Identifier could not be parsed
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Errors raised by the versioned codec
#[derive(Debug, ThisError)]
pub enum CodecError {
    /// Envelope names a different schema than the one being read
    #[error("expected schema {expected}, found {found}")]
    SchemaMismatch {
        /// Schema the reader expected
        expected: String,
        /// Schema found in the envelope
        found: String,
    },

    /// Envelope was written by a newer version than this reader understands
    #[error("{schema} version {found} is newer than supported version {supported}")]
    UnsupportedVersion {
        /// Schema name
        schema: String,
        /// Version found in the envelope
        found: u16,
        /// Highest version this reader supports
        supported: u16,
    },

    /// CBOR encoding failed
    #[error("encode error: {0}")]
    Encode(String),

    /// CBOR decoding failed
    #[error("decode error: {0}")]
    Decode(String),
}
