//! Bounded task executors backing the pipeline stages.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use tokio::sync::{Semaphore, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::error::{ErrorKind, ScalingResult};
use crate::scaling_error;

/// Owns the tasks of one pipeline stage.
///
/// A fixed engine runs at most `worker_threads` tasks at a time, the rest wait for a slot. A
/// cached engine runs every task immediately. Tasks live in a [`JoinSet`], so dropping the engine
/// aborts whatever is still running and an engine can never leak its tasks.
#[derive(Debug)]
pub struct ExecuteEngine {
    name: String,
    worker_threads: Option<usize>,
    run_permits: Option<Arc<Semaphore>>,
    tasks: Mutex<JoinSet<()>>,
    shut_down: AtomicBool,
}

/// Completion handle of a task submitted to an [`ExecuteEngine`].
#[derive(Debug)]
pub struct ExecuteHandle {
    task_name: String,
    result_rx: oneshot::Receiver<ScalingResult<()>>,
}

impl ExecuteHandle {
    /// Waits for the task and returns its result.
    ///
    /// A task aborted by [`ExecuteEngine::shutdown`] yields [`ErrorKind::TaskCancelled`].
    pub async fn join(self) -> ScalingResult<()> {
        match self.result_rx.await {
            Ok(result) => result,
            Err(_) => Err(scaling_error!(
                ErrorKind::TaskCancelled,
                "Task was cancelled before completing",
                self.task_name
            )),
        }
    }
}

impl ExecuteEngine {
    /// Creates an engine running at most `worker_threads` tasks concurrently.
    pub fn fixed(name: impl Into<String>, worker_threads: usize) -> Self {
        Self::new(name.into(), Some(worker_threads.max(1)))
    }

    /// Creates an engine without a concurrency bound.
    pub fn cached(name: impl Into<String>) -> Self {
        Self::new(name.into(), None)
    }

    fn new(name: String, worker_threads: Option<usize>) -> Self {
        debug!(engine = %name, ?worker_threads, "execute engine created");

        Self {
            name,
            worker_threads,
            run_permits: worker_threads.map(|threads| Arc::new(Semaphore::new(threads))),
            tasks: Mutex::new(JoinSet::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of tasks that may run concurrently, `None` for a cached engine.
    pub fn worker_threads(&self) -> Option<usize> {
        self.worker_threads
    }

    /// Submits `future` for execution.
    ///
    /// Must be called from within a tokio runtime. A panic inside the task is reported through
    /// the handle as [`ErrorKind::WorkerPanic`].
    pub fn submit<F>(&self, task_name: impl Into<String>, future: F) -> ExecuteHandle
    where
        F: Future<Output = ScalingResult<()>> + Send + 'static,
    {
        let task_name = task_name.into();
        let (result_tx, result_rx) = oneshot::channel();

        if self.shut_down.load(Ordering::Acquire) {
            let _ = result_tx.send(Err(scaling_error!(
                ErrorKind::TaskCancelled,
                "Execute engine was shut down",
                format!("engine {}, task {task_name}", self.name)
            )));

            return ExecuteHandle {
                task_name,
                result_rx,
            };
        }

        let run_permits = self.run_permits.clone();
        let engine_name = self.name.clone();
        let name = task_name.clone();

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        // Reap finished tasks so the set only holds live ones.
        while tasks.try_join_next().is_some() {}

        tasks.spawn(async move {
            let _permit = match run_permits {
                Some(run_permits) => match run_permits.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    // The semaphore is closed on shutdown. Dropping the sender cancels the handle.
                    Err(_) => return,
                },
                None => None,
            };

            let result = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(result) => result,
                Err(_) => {
                    error!(engine = %engine_name, task = %name, "task panicked");
                    Err(scaling_error!(
                        ErrorKind::WorkerPanic,
                        "Task panicked",
                        format!("engine {engine_name}, task {name}")
                    ))
                }
            };

            let _ = result_tx.send(result);
        });

        debug!(engine = %self.name, task = %task_name, "task submitted");

        ExecuteHandle {
            task_name,
            result_rx,
        }
    }

    /// Number of tasks that were submitted and have not completed yet.
    pub fn active_tasks(&self) -> usize {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}

        tasks.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Cancels outstanding tasks and waits until all of them are gone.
    ///
    /// Later submissions are rejected. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(run_permits) = &self.run_permits {
            run_permits.close();
        }

        let mut tasks = {
            let mut guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };

        let outstanding = tasks.len();
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}

        info!(engine = %self.name, outstanding, "execute engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn fixed_engine_bounds_concurrency() {
        let engine = ExecuteEngine::fixed("Inventory-test", 2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let running = running.clone();
                let peak = peak.clone();
                engine.submit(format!("task-{i}"), async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        for handle in handles {
            handle.join().await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(engine.active_tasks(), 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_outstanding_tasks() {
        let engine = ExecuteEngine::cached("Incremental-test");
        let handle = engine.submit("forever", async {
            futures::future::pending::<()>().await;
            Ok(())
        });

        engine.shutdown().await;

        let err = handle.join().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TaskCancelled);
        assert!(engine.is_shut_down());

        let rejected = engine.submit("late", async { Ok(()) });
        assert_eq!(
            rejected.join().await.unwrap_err().kind(),
            ErrorKind::TaskCancelled
        );
    }

    #[tokio::test]
    async fn panics_are_reported_through_the_handle() {
        let engine = ExecuteEngine::fixed("Importer-test", 1);
        let handle = engine.submit("boom", async {
            panic!("boom");
        });

        assert_eq!(
            handle.join().await.unwrap_err().kind(),
            ErrorKind::WorkerPanic
        );
    }
}
