//! Logging setup shared by scaling binaries and tests.

pub mod tracing;
