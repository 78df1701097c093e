pub mod channel;
pub mod concurrency;
pub mod context;
pub mod dumper;
pub mod engine;
pub mod error;
#[cfg(feature = "failpoints")]
pub mod failpoints;
pub mod importer;
pub mod lock;
mod macros;
pub mod progress;
pub mod ratelimit;
pub mod task;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
