//! Job checkpoint: model, YAML codec, persistence, and the single-writer tracker.

mod model;
mod store;
mod tracker;
pub mod yaml;

pub use model::{IncrementalProgress, InventoryProgress, JobProgress, JobStatus};
pub use store::{JobProgressStore, MemoryJobProgressStore};
pub use tracker::JobProgressTracker;
