use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::bail;
use crate::concurrency::shutdown::ShutdownTx;
use crate::error::{ErrorKind, ScalingResult};
use crate::lock::context::LockContext;
use crate::lock::definition::LockDefinition;
use crate::lock::manager::LockManager;

/// Proof that a job holds its lock.
///
/// The lock can be lost without the job doing anything, for example when the coordination
/// session expires. A job must stop processing at that point, which [`JobLockGuard::stop_on_loss`]
/// wires up.
#[derive(Debug)]
pub struct JobLockGuard<M> {
    context: Arc<LockContext<M>>,
    definition: LockDefinition,
    session: watch::Receiver<bool>,
    released: watch::Sender<bool>,
}

impl<M> JobLockGuard<M>
where
    M: LockManager + Send + Sync + 'static,
{
    /// Takes the lock, or returns `None` when somebody else holds it past `timeout`.
    pub async fn acquire(
        context: Arc<LockContext<M>>,
        definition: LockDefinition,
        timeout: Duration,
    ) -> Option<Self> {
        let session = context.manager().subscribe_session();
        if !context.try_lock_with_timeout(&definition, timeout).await {
            info!(lock = %definition, "job lock is held elsewhere");
            return None;
        }

        info!(lock = %definition, "job lock acquired");

        Some(Self {
            context,
            definition,
            session,
            released: watch::channel(false).0,
        })
    }

    pub fn definition(&self) -> &LockDefinition {
        &self.definition
    }

    /// Returns `true` once the session backing the lock is gone.
    pub fn is_lost(&self) -> bool {
        !*self.session.borrow() || self.session.has_changed().is_err()
    }

    /// Fails with [`ErrorKind::LockLost`] when the lock is no longer held.
    pub fn ensure_held(&self) -> ScalingResult<()> {
        if self.is_lost() {
            bail!(
                ErrorKind::LockLost,
                "Job lock was lost",
                self.definition.to_string()
            );
        }

        Ok(())
    }

    /// Resolves once the lock is lost.
    pub async fn lost(&self) {
        let mut session = self.session.clone();
        // A closed session channel means the coordination service is gone, which loses the
        // lock as well.
        let _ = session.wait_for(|alive| !*alive).await;
    }

    /// Broadcasts `shutdown_tx` when the lock is lost.
    ///
    /// The watcher ends without signaling once the guard is released.
    pub fn stop_on_loss(&self, shutdown_tx: ShutdownTx) -> JoinHandle<()> {
        let mut session = self.session.clone();
        let mut released = self.released.subscribe();
        let definition = self.definition.clone();

        tokio::spawn(async move {
            tokio::select! {
                biased;

                _ = released.wait_for(|released| *released) => {}
                _ = session.wait_for(|alive| !*alive) => {
                    error!(lock = %definition, "job lock lost, stopping the job");
                    shutdown_tx.shutdown();
                }
            }
        })
    }

    /// Releases the lock. Releasing twice is harmless.
    pub async fn release(&self) {
        if self.released.send_replace(true) {
            return;
        }

        self.context.un_lock(&self.definition).await;
        info!(lock = %self.definition, "job lock released");
    }
}
