use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::load::Config;
use crate::shared::{AlgorithmConfig, ReconnectionConfig, RetryConfig, ValidationError};

/// Name of the in-memory stream channel algorithm.
pub const MEMORY_CHANNEL_TYPE: &str = "MEMORY";

/// Property of the in-memory channel holding its capacity in records.
pub const BLOCK_QUEUE_SIZE_KEY: &str = "block-queue-size";

/// Default capacity of the in-memory channel.
pub const DEFAULT_BLOCK_QUEUE_SIZE: usize = 10000;

/// Process configuration of a scaling job as written by the user.
///
/// Every block is optional. [`ProcessConfig::resolve`] fills in the defaults and produces the
/// immutable [`ResolvedProcessConfig`] used for the rest of the job. Multi-word keys also accept
/// their lowercase form, which is how the layered file loader hands them over.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessConfig {
    #[serde(default)]
    pub input: Option<InputConfig>,
    #[serde(default)]
    pub output: Option<OutputConfig>,
    #[serde(default, alias = "streamchannel")]
    pub stream_channel: Option<AlgorithmConfig>,
}

/// Settings for the dump stages reading from the source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputConfig {
    /// Size of the inventory engine.
    #[serde(default = "default_worker_threads", alias = "workerthreads")]
    pub worker_threads: u16,
    /// Maximum number of rows read per inventory page.
    #[serde(default = "default_batch_size", alias = "batchsize")]
    pub batch_size: usize,
    /// Maximum time, in milliseconds, a batch of change events waits to fill up before it is
    /// pushed anyway.
    #[serde(default = "default_max_fill_ms", alias = "maxfillms")]
    pub max_fill_ms: u64,
    /// Throttles reads from the source. No throttling when absent.
    #[serde(default, alias = "ratelimiter")]
    pub rate_limiter: Option<AlgorithmConfig>,
    /// Reconnection behavior of the incremental dumper.
    #[serde(default)]
    pub reconnection: ReconnectionConfig,
}

/// Settings for the import stage writing to the target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputConfig {
    /// Size of the import engine.
    #[serde(default = "default_worker_threads", alias = "workerthreads")]
    pub worker_threads: u16,
    /// Maximum number of records fetched from the channel per batch.
    #[serde(default = "default_batch_size", alias = "batchsize")]
    pub batch_size: usize,
    /// Maximum time, in milliseconds, to wait for records on an empty channel.
    #[serde(default = "default_fetch_timeout_ms", alias = "fetchtimeoutms")]
    pub fetch_timeout_ms: u64,
    /// Throttles writes to the target. No throttling when absent.
    #[serde(default, alias = "ratelimiter")]
    pub rate_limiter: Option<AlgorithmConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl InputConfig {
    pub const DEFAULT_MAX_FILL_MS: u64 = 1000;

    pub fn max_fill(&self) -> Duration {
        Duration::from_millis(self.max_fill_ms)
    }
}

impl OutputConfig {
    pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 1000;

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Default worker count of the inventory and import engines.
pub const DEFAULT_WORKER_THREADS: u16 = 8;

/// Default batch size for reads and imports.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

fn default_worker_threads() -> u16 {
    DEFAULT_WORKER_THREADS
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_max_fill_ms() -> u64 {
    InputConfig::DEFAULT_MAX_FILL_MS
}

fn default_fetch_timeout_ms() -> u64 {
    OutputConfig::DEFAULT_FETCH_TIMEOUT_MS
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            batch_size: default_batch_size(),
            max_fill_ms: default_max_fill_ms(),
            rate_limiter: None,
            reconnection: ReconnectionConfig::default(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            batch_size: default_batch_size(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            rate_limiter: None,
            retry: RetryConfig::default(),
        }
    }
}

/// Returns the default stream channel: the bounded in-memory queue.
pub fn default_stream_channel() -> AlgorithmConfig {
    AlgorithmConfig::new(MEMORY_CHANNEL_TYPE)
        .with_prop(BLOCK_QUEUE_SIZE_KEY, DEFAULT_BLOCK_QUEUE_SIZE.to_string())
}

/// Fully defaulted process configuration. Every block is present.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedProcessConfig {
    pub input: InputConfig,
    pub output: OutputConfig,
    pub stream_channel: AlgorithmConfig,
}

impl ProcessConfig {
    /// Fills absent blocks with their defaults and validates the result.
    pub fn resolve(self) -> Result<ResolvedProcessConfig, ValidationError> {
        let resolved = ResolvedProcessConfig {
            input: self.input.unwrap_or_default(),
            output: self.output.unwrap_or_default(),
            stream_channel: self.stream_channel.unwrap_or_else(default_stream_channel),
        };
        resolved.validate()?;

        Ok(resolved)
    }
}

impl ResolvedProcessConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_positive("input.workerThreads", self.input.worker_threads as usize)?;
        check_positive("input.batchSize", self.input.batch_size)?;
        check_positive("input.maxFillMs", self.input.max_fill_ms as usize)?;
        check_positive("output.workerThreads", self.output.worker_threads as usize)?;
        check_positive("output.batchSize", self.output.batch_size)?;

        self.input.reconnection.validate()?;
        self.output.retry.validate()?;

        if self.stream_channel.algorithm_type.trim().is_empty() {
            return Err(ValidationError::InvalidFieldValue {
                field: "streamChannel.type".to_string(),
                constraint: "must not be empty".to_string(),
            });
        }

        Ok(())
    }
}

fn check_positive(field: &str, value: usize) -> Result<(), ValidationError> {
    if value == 0 {
        return Err(ValidationError::InvalidFieldValue {
            field: field.to_string(),
            constraint: "must be greater than 0".to_string(),
        });
    }

    Ok(())
}

impl Config for ProcessConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        self.clone().resolve().map(|_| ())
    }
}
