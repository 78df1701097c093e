use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::bail;
use crate::error::{ErrorKind, ScalingResult};

/// Boundary to the external coordination service holding lock keys.
///
/// Lock keys behave like ephemeral nodes: they belong to the session of the instance that
/// created them and vanish when that session expires.
pub trait CoordinationRepository {
    /// Creates `key` owned by `owner` if nobody holds it. Never waits for the key to be free.
    fn try_persist_lock(
        &self,
        key: &str,
        owner: &str,
    ) -> impl Future<Output = ScalingResult<bool>> + Send;

    /// Deletes `key` if `owner` holds it. Returns whether a key was deleted.
    fn delete_lock(
        &self,
        key: &str,
        owner: &str,
    ) -> impl Future<Output = ScalingResult<bool>> + Send;

    /// Returns the current holder of `key`.
    fn lock_owner(&self, key: &str) -> impl Future<Output = ScalingResult<Option<String>>> + Send;

    /// Notifies on every change of any lock key.
    fn watch_changes(&self) -> watch::Receiver<u64>;

    /// Tracks whether the session of `owner` is alive.
    fn subscribe_session(&self, owner: &str) -> watch::Receiver<bool>;
}

#[derive(Debug)]
struct Inner {
    locks: HashMap<String, String>,
    sessions: HashMap<String, watch::Sender<bool>>,
}

impl Inner {
    fn session(&mut self, owner: &str) -> &watch::Sender<bool> {
        self.sessions
            .entry(owner.to_string())
            .or_insert_with(|| watch::channel(true).0)
    }

    fn is_session_alive(&mut self, owner: &str) -> bool {
        *self.session(owner).borrow()
    }
}

/// In-process coordination service.
#[derive(Debug, Clone)]
pub struct MemoryCoordinationRepository {
    inner: Arc<Mutex<Inner>>,
    changes: Arc<watch::Sender<u64>>,
}

impl MemoryCoordinationRepository {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                locks: HashMap::new(),
                sessions: HashMap::new(),
            })),
            changes: Arc::new(watch::channel(0).0),
        }
    }

    /// Expires the session of `owner`, dropping every lock it held.
    pub fn expire_session(&self, owner: &str) {
        let removed = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let before = inner.locks.len();
            inner.locks.retain(|_, holder| holder != owner);
            inner.session(owner).send_replace(false);

            before - inner.locks.len()
        };

        warn!(owner, removed, "coordination session expired");
        self.notify_change();
    }

    fn notify_change(&self) {
        self.changes.send_modify(|version| *version += 1);
    }
}

impl Default for MemoryCoordinationRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl CoordinationRepository for MemoryCoordinationRepository {
    async fn try_persist_lock(&self, key: &str, owner: &str) -> ScalingResult<bool> {
        {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if !inner.is_session_alive(owner) {
                bail!(
                    ErrorKind::LockLost,
                    "Coordination session expired",
                    format!("owner {owner}")
                );
            }

            if inner.locks.contains_key(key) {
                return Ok(false);
            }

            inner.locks.insert(key.to_string(), owner.to_string());
        }

        debug!(key, owner, "lock key created");
        self.notify_change();

        Ok(true)
    }

    async fn delete_lock(&self, key: &str, owner: &str) -> ScalingResult<bool> {
        let deleted = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            match inner.locks.get(key) {
                Some(holder) if holder == owner => inner.locks.remove(key).is_some(),
                _ => false,
            }
        };

        if deleted {
            debug!(key, owner, "lock key deleted");
            self.notify_change();
        }

        Ok(deleted)
    }

    async fn lock_owner(&self, key: &str) -> ScalingResult<Option<String>> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        Ok(inner.locks.get(key).cloned())
    }

    fn watch_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn subscribe_session(&self, owner: &str) -> watch::Receiver<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        inner.session(owner).subscribe()
    }
}
