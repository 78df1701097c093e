//! Configuration types and loading for scaling jobs.

pub mod environment;
pub mod load;
pub mod shared;
