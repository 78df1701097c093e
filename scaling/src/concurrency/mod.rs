//! Concurrency primitives shared by the pipeline stages.
//!
//! Stages never share mutable state directly. They coordinate through channels, a broadcast
//! [`shutdown`] signal, and once-initialized resources ([`once`]).

pub mod once;
pub mod shutdown;
pub mod stream;
