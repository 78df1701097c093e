//! Distributed locks serializing job ownership across the cluster.
//!
//! A [`LockDefinition`] names the resource. [`LockContext`] is the facade the rest of the process
//! uses, on top of a [`LockManager`] that talks to the coordination service through a
//! [`CoordinationRepository`].

mod context;
mod definition;
mod guard;
mod manager;
mod repository;

pub use context::{LockContext, MAX_TRY_LOCK};
pub use definition::{LOCK_ROOT, LockDefinition};
pub use guard::JobLockGuard;
pub use manager::{ClusterLockManager, LockManager};
pub use repository::{CoordinationRepository, MemoryCoordinationRepository};
