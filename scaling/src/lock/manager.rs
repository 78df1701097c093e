use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::lock::definition::LockDefinition;
use crate::lock::repository::CoordinationRepository;

/// Upper bound between two acquisition attempts when no change notification arrives.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Cluster-wide mutual exclusion over [`LockDefinition`]s.
pub trait LockManager {
    /// Tries to take the lock, waiting at most `timeout` for the current holder to let go.
    fn try_lock(
        &self,
        definition: &LockDefinition,
        timeout: Duration,
    ) -> impl Future<Output = bool> + Send;

    /// Releases the lock if this manager holds it. Locks held by others are left alone.
    fn un_lock(&self, definition: &LockDefinition) -> impl Future<Output = ()> + Send;

    /// Returns whether anybody holds the lock right now.
    fn is_locked(&self, definition: &LockDefinition) -> impl Future<Output = bool> + Send;

    /// Tracks whether the locks taken by this manager are still backed by a live session.
    fn subscribe_session(&self) -> watch::Receiver<bool>;
}

/// [`LockManager`] of one instance, backed by a [`CoordinationRepository`].
#[derive(Debug, Clone)]
pub struct ClusterLockManager<R> {
    instance_id: String,
    repository: R,
}

impl<R> ClusterLockManager<R>
where
    R: CoordinationRepository + Send + Sync,
{
    /// Creates a manager under a fresh, random instance id.
    pub fn new(repository: R) -> Self {
        Self::with_instance_id(Uuid::new_v4().to_string(), repository)
    }

    pub fn with_instance_id(instance_id: impl Into<String>, repository: R) -> Self {
        Self {
            instance_id: instance_id.into(),
            repository,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }
}

impl<R> LockManager for ClusterLockManager<R>
where
    R: CoordinationRepository + Send + Sync,
{
    async fn try_lock(&self, definition: &LockDefinition, timeout: Duration) -> bool {
        let key = definition.lock_key();
        let deadline = Instant::now() + timeout;
        let mut changes = self.repository.watch_changes();

        loop {
            // Marking the version seen first means a release racing with the attempt below
            // still wakes the wait.
            changes.borrow_and_update();

            match self.repository.try_persist_lock(&key, &self.instance_id).await {
                Ok(true) => {
                    debug!(lock = %key, instance_id = %self.instance_id, "lock acquired");
                    return true;
                }
                Ok(false) => {}
                Err(err) if err.is_transient() => {
                    warn!(lock = %key, error = %err, "lock attempt failed, retrying");
                }
                Err(err) => {
                    error!(lock = %key, error = %err, "lock attempt failed");
                    return false;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(lock = %key, instance_id = %self.instance_id, "lock is held elsewhere");
                return false;
            }

            let wait = (deadline - now).min(RETRY_INTERVAL);
            // A closed notification channel only leaves the periodic retry.
            let _ = tokio::time::timeout(wait, changes.changed()).await;
        }
    }

    async fn un_lock(&self, definition: &LockDefinition) {
        let key = definition.lock_key();

        match self.repository.delete_lock(&key, &self.instance_id).await {
            Ok(true) => debug!(lock = %key, instance_id = %self.instance_id, "lock released"),
            Ok(false) => debug!(lock = %key, "lock was not held by this instance"),
            Err(err) => warn!(lock = %key, error = %err, "failed to release lock"),
        }
    }

    async fn is_locked(&self, definition: &LockDefinition) -> bool {
        let key = definition.lock_key();

        match self.repository.lock_owner(&key).await {
            Ok(owner) => owner.is_some(),
            Err(err) => {
                warn!(lock = %key, error = %err, "failed to read lock owner");
                false
            }
        }
    }

    fn subscribe_session(&self) -> watch::Receiver<bool> {
        self.repository.subscribe_session(&self.instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::repository::MemoryCoordinationRepository;

    #[tokio::test(start_paused = true)]
    async fn contended_lock_times_out() {
        let repository = MemoryCoordinationRepository::new();
        let first = ClusterLockManager::with_instance_id("i1", repository.clone());
        let second = ClusterLockManager::with_instance_id("i2", repository);
        let lock = LockDefinition::job("j1");

        assert!(first.try_lock(&lock, Duration::from_secs(1)).await);

        let start = Instant::now();
        assert!(!second.try_lock(&lock, Duration::from_millis(500)).await);
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_takes_the_lock_once_it_is_released() {
        let repository = MemoryCoordinationRepository::new();
        let first = ClusterLockManager::with_instance_id("i1", repository.clone());
        let second = ClusterLockManager::with_instance_id("i2", repository);
        let lock = LockDefinition::database("sharding_db");

        assert!(first.try_lock(&lock, Duration::ZERO).await);

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { second.try_lock(&lock, Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        first.un_lock(&lock).await;

        assert!(waiter.await.unwrap());
        assert!(first.is_locked(&lock).await);
    }

    #[tokio::test]
    async fn unlocking_a_foreign_lock_keeps_it() {
        let repository = MemoryCoordinationRepository::new();
        let holder = ClusterLockManager::new(repository.clone());
        let other = ClusterLockManager::new(repository);
        let lock = LockDefinition::job("j1");

        assert!(holder.try_lock(&lock, Duration::ZERO).await);
        other.un_lock(&lock).await;
        other.un_lock(&lock).await;

        assert!(other.is_locked(&lock).await);
        assert!(!other.try_lock(&lock, Duration::ZERO).await);
    }
}
