use kvplane_locks::LockManagerError;
use thiserror::Error;

/// Errors raised by the in-memory lock table.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// A reservation was requested without an owner.
    #[error("no owner given for lock {0}")]
    MissingOwner(String),
}

impl LockManagerError for Error {}
