//! Shared configuration types for scaling jobs.

mod algorithm;
mod base;
mod process;
mod reconnection;
mod retry;

pub use algorithm::AlgorithmConfig;
pub use base::ValidationError;
pub use process::{
    BLOCK_QUEUE_SIZE_KEY, DEFAULT_BATCH_SIZE, DEFAULT_BLOCK_QUEUE_SIZE, DEFAULT_WORKER_THREADS,
    InputConfig, MEMORY_CHANNEL_TYPE, OutputConfig, ProcessConfig, ResolvedProcessConfig,
    default_stream_channel,
};
pub use reconnection::ReconnectionConfig;
pub use retry::RetryConfig;
