//! In-memory (single admin) implementation of plan locks.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kvplane_locks::{LockManager, LockStatus};
use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug)]
struct Holder {
    owner: String,
    guards: usize,
}

type LockTable = Arc<Mutex<HashMap<String, Holder>>>;

/// In-memory lock manager.
#[derive(Clone, Debug, Default)]
pub struct MemoryLockManager {
    map: LockTable,
}

/// Releases one reservation when dropped.
#[derive(Debug)]
pub struct MemoryLockGuard {
    map: LockTable,
    key: String,
}

impl MemoryLockGuard {
    /// The locked resource.
    #[must_use]
    pub fn resource_id(&self) -> &str {
        &self.key
    }
}

impl Drop for MemoryLockGuard {
    fn drop(&mut self) {
        let mut map = self.map.lock();
        if let Some(holder) = map.get_mut(&self.key) {
            holder.guards -= 1;
            if holder.guards == 0 {
                debug!("Released lock {} held by {}", self.key, holder.owner);
                map.remove(&self.key);
            }
        }
    }
}

impl MemoryLockManager {
    /// Creates a new instance of `MemoryLockManager`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of resources currently locked.
    #[must_use]
    pub fn held(&self) -> usize {
        self.map.lock().len()
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    type Error = Error;
    type Guard = MemoryLockGuard;

    async fn check(&self, resource_id: String) -> Result<LockStatus, Self::Error> {
        Ok(self
            .map
            .lock()
            .get(&resource_id)
            .map_or(LockStatus::Free, |h| LockStatus::HeldBy(h.owner.clone())))
    }

    async fn try_lock(
        &self,
        resource_id: String,
        owner: String,
    ) -> Result<Option<Self::Guard>, Self::Error> {
        if owner.is_empty() {
            return Err(Error::MissingOwner(resource_id));
        }
        let mut map = self.map.lock();

        match map.get_mut(&resource_id) {
            Some(holder) if holder.owner != owner => return Ok(None),
            Some(holder) => holder.guards += 1,
            None => {
                map.insert(resource_id.clone(), Holder { owner, guards: 1 });
            }
        }

        Ok(Some(MemoryLockGuard {
            map: self.map.clone(),
            key: resource_id,
        }))
    }
}
