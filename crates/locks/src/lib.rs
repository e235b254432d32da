//! Abstract interface for plan-scoped component reservations.
//!
//! A running plan reserves the topology components it will mutate so that
//! concurrently running plans touching the same components are refused at
//! admission. Reservations are not data locks: they carry no protection
//! within a single plan.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;

/// Marker trait for `LockManager` errors
pub trait LockManagerError: Debug + Error + Send + Sync + 'static {}

/// Represents the current status of a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    /// The lock is free.
    Free,

    /// The lock is held by the owner identified by the String.
    HeldBy(String),
}

/// A lock manager handing out owner-tagged reservations.
///
/// Locks are represented by a guard type that releases the reservation when
/// dropped.
#[async_trait]
pub trait LockManager: Send + Sync + 'static {
    /// The error type for lock operations.
    type Error: LockManagerError + Send + Sync + 'static;

    /// The guard type that releases the lock on drop.
    type Guard: Send + Sync + 'static;

    /// Checks the status of a lock.
    ///
    /// # Arguments
    /// * `resource_id`: The unique identifier for the resource.
    async fn check(&self, resource_id: String) -> Result<LockStatus, Self::Error>;

    /// Attempts to acquire a lock without waiting.
    ///
    /// If the lock is acquired successfully, returns `Ok(Some(Guard))`.
    /// Re-acquiring a lock already held by the same owner also succeeds and
    /// yields an additional guard; the reservation lasts until every guard of
    /// that owner is dropped. If the lock is held by another owner, returns
    /// `Ok(None)`.
    ///
    /// # Arguments
    /// * `resource_id`: A unique identifier for the resource to be locked.
    /// * `owner`: Identifies the holder, reported by [`LockManager::check`].
    async fn try_lock(
        &self,
        resource_id: String,
        owner: String,
    ) -> Result<Option<Self::Guard>, Self::Error>;
}
