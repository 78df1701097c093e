//! Bounded hand-off between one dumper and one importer.
//!
//! Records keep their push order. A full channel suspends the producer until the consumer
//! fetches, and both sides return promptly once the stop signal is sent.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scaling_config::shared::{
    AlgorithmConfig, BLOCK_QUEUE_SIZE_KEY, DEFAULT_BLOCK_QUEUE_SIZE, MEMORY_CHANNEL_TYPE,
};

use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx};
use crate::error::{ErrorKind, ScalingResult};
use crate::ratelimit::RateLimiter;
use crate::scaling_error;
use crate::types::{Position, Record};

mod memory;

pub use memory::{MemoryPipelineChannel, MemoryPipelineChannelCreator};

#[async_trait]
pub trait PipelineChannel: fmt::Debug + Send + Sync {
    /// Appends `records`, waiting while the channel is full.
    ///
    /// The rate limiter, when configured, is applied once per call before any record is
    /// admitted. Returns the records that were not admitted when the stop signal arrives.
    async fn push_records(&self, records: Vec<Record>) -> ShutdownResult<(), Vec<Record>>;

    /// Returns up to `batch_size` records in push order.
    ///
    /// Waits at most `timeout` for the first record. Returns an empty batch on timeout or once
    /// the stop signal was sent.
    async fn fetch_records(&self, batch_size: usize, timeout: Duration) -> Vec<Record>;

    /// Records that everything up to `position` was durably applied.
    fn ack(&self, position: Position);

    /// Returns the last acknowledged position, if any.
    fn acked_position(&self) -> Option<Position>;
}

/// Builds a fresh channel for each dumper and importer pair.
pub trait PipelineChannelCreator: fmt::Debug + Send + Sync {
    fn algorithm_type(&self) -> &'static str;

    fn create(
        &self,
        rate_limiter: Option<RateLimiter>,
        shutdown_rx: ShutdownRx,
    ) -> Arc<dyn PipelineChannel>;
}

/// Resolves a channel creator by name. Unknown names are configuration errors.
pub fn build_channel_creator(
    config: &AlgorithmConfig,
) -> ScalingResult<Arc<dyn PipelineChannelCreator>> {
    match config.algorithm_type.to_ascii_uppercase().as_str() {
        MEMORY_CHANNEL_TYPE => {
            let block_queue_size =
                config.parse_prop_or(BLOCK_QUEUE_SIZE_KEY, DEFAULT_BLOCK_QUEUE_SIZE)?;
            if block_queue_size == 0 {
                return Err(scaling_error!(
                    ErrorKind::ConfigError,
                    "Memory channel needs a positive capacity",
                    format!("{BLOCK_QUEUE_SIZE_KEY}=0")
                ));
            }

            Ok(Arc::new(MemoryPipelineChannelCreator::new(block_queue_size)))
        }
        other => Err(scaling_error!(
            ErrorKind::UnknownAlgorithm,
            "Unknown stream channel algorithm",
            other.to_string()
        )),
    }
}
