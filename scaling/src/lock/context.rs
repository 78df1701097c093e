use std::time::Duration;

use crate::lock::definition::LockDefinition;
use crate::lock::manager::LockManager;

/// Wait bound of [`LockContext::try_lock`].
pub const MAX_TRY_LOCK: Duration = Duration::from_secs(3 * 60);

/// Entry point to distributed locks for the rest of the process.
///
/// It holds nothing but the manager talking to the coordination service.
#[derive(Debug, Clone)]
pub struct LockContext<M> {
    manager: M,
}

impl<M> LockContext<M>
where
    M: LockManager,
{
    pub fn new(manager: M) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    /// Tries to take the lock, waiting at most [`MAX_TRY_LOCK`].
    pub async fn try_lock(&self, definition: &LockDefinition) -> bool {
        self.manager.try_lock(definition, MAX_TRY_LOCK).await
    }

    /// Tries to take the lock, waiting at most `timeout`.
    pub async fn try_lock_with_timeout(
        &self,
        definition: &LockDefinition,
        timeout: Duration,
    ) -> bool {
        self.manager.try_lock(definition, timeout).await
    }

    /// Releases the lock. Does nothing when the caller does not hold it.
    pub async fn un_lock(&self, definition: &LockDefinition) {
        self.manager.un_lock(definition).await
    }

    /// Point in time view of whether the lock is held. Only informational, since the answer may
    /// be stale by the time it is read.
    pub async fn is_locked(&self, definition: &LockDefinition) -> bool {
        self.manager.is_locked(definition).await
    }
}
