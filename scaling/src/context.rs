//! Per-job process context: resolved configuration, stage engines, rate limiters and the
//! channel factory.

use std::sync::Arc;

use scaling_config::shared::{
    AlgorithmConfig, InputConfig, OutputConfig, ProcessConfig, ResolvedProcessConfig,
};
use tracing::info;

use crate::channel::{PipelineChannel, PipelineChannelCreator, build_channel_creator};
use crate::concurrency::once::InitOnce;
use crate::concurrency::shutdown::ShutdownRx;
use crate::engine::ExecuteEngine;
use crate::error::ScalingResult;
use crate::ratelimit::{RateLimitSpec, RateLimiter};

/// Everything a job's stages share, derived once from the job's [`ProcessConfig`].
///
/// Algorithm names are resolved here, so a misconfigured job fails before any stage starts.
/// The three engines and the two rate limiters are built on first use only, and at most once.
///
/// Engines own their tasks. Dropping the context aborts whatever is still running on them, and
/// [`ProcessContext::shutdown`] does the same while waiting for the tasks to be gone.
#[derive(Debug)]
pub struct ProcessContext {
    job_id: String,
    config: ResolvedProcessConfig,
    input_rate_limiter: InitOnce<Option<RateLimiter>>,
    output_rate_limiter: InitOnce<Option<RateLimiter>>,
    channel_creator: Arc<dyn PipelineChannelCreator>,
    inventory_engine: InitOnce<ExecuteEngine>,
    incremental_engine: InitOnce<ExecuteEngine>,
    importer_engine: InitOnce<ExecuteEngine>,
}

impl ProcessContext {
    pub fn new(job_id: impl Into<String>, config: ProcessConfig) -> ScalingResult<Self> {
        let job_id = job_id.into();
        let config = config.resolve()?;

        let input_rate_limiter = lazy_rate_limiter(config.input.rate_limiter.as_ref())?;
        let output_rate_limiter = lazy_rate_limiter(config.output.rate_limiter.as_ref())?;
        let channel_creator = build_channel_creator(&config.stream_channel)?;

        let inventory_engine = {
            let name = format!("Inventory-{job_id}");
            let threads = config.input.worker_threads as usize;
            InitOnce::new(move || ExecuteEngine::fixed(name.clone(), threads))
        };
        let incremental_engine = {
            // One task per source stream, and the number of streams is not known upfront.
            let name = format!("Incremental-{job_id}");
            InitOnce::new(move || ExecuteEngine::cached(name.clone()))
        };
        let importer_engine = {
            let name = format!("Importer-{job_id}");
            let threads = config.output.worker_threads as usize;
            InitOnce::new(move || ExecuteEngine::fixed(name.clone(), threads))
        };

        info!(
            %job_id,
            input_threads = config.input.worker_threads,
            output_threads = config.output.worker_threads,
            stream_channel = %config.stream_channel.algorithm_type,
            "process context created"
        );

        Ok(Self {
            job_id,
            config,
            input_rate_limiter,
            output_rate_limiter,
            channel_creator,
            inventory_engine,
            incremental_engine,
            importer_engine,
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn config(&self) -> &ResolvedProcessConfig {
        &self.config
    }

    pub fn input_config(&self) -> &InputConfig {
        &self.config.input
    }

    pub fn output_config(&self) -> &OutputConfig {
        &self.config.output
    }

    /// Limiter applied to the dump stages, `None` meaning no throttling.
    pub fn input_rate_limiter(&self) -> Option<RateLimiter> {
        self.input_rate_limiter.get().clone()
    }

    /// Limiter applied to the import stage, `None` meaning no throttling.
    pub fn output_rate_limiter(&self) -> Option<RateLimiter> {
        self.output_rate_limiter.get().clone()
    }

    pub fn channel_creator(&self) -> &Arc<dyn PipelineChannelCreator> {
        &self.channel_creator
    }

    /// Creates the channel for one dumper and importer pair.
    ///
    /// Pushes into the channel are throttled by the input limiter.
    pub fn create_channel(&self, shutdown_rx: ShutdownRx) -> Arc<dyn PipelineChannel> {
        self.channel_creator.create(self.input_rate_limiter(), shutdown_rx)
    }

    pub fn inventory_dumper_engine(&self) -> &ExecuteEngine {
        self.inventory_engine.get()
    }

    pub fn incremental_dumper_engine(&self) -> &ExecuteEngine {
        self.incremental_engine.get()
    }

    pub fn importer_engine(&self) -> &ExecuteEngine {
        self.importer_engine.get()
    }

    /// Shuts down every engine that was built. Engines never built stay unbuilt.
    pub async fn shutdown(&self) {
        for engine in [
            &self.inventory_engine,
            &self.incremental_engine,
            &self.importer_engine,
        ] {
            if let Some(engine) = engine.get_if_initialized() {
                engine.shutdown().await;
            }
        }

        info!(job_id = %self.job_id, "process context shut down");
    }
}

/// Validates the limiter selection now and defers building it to first use.
fn lazy_rate_limiter(
    config: Option<&AlgorithmConfig>,
) -> ScalingResult<InitOnce<Option<RateLimiter>>> {
    let spec = config.map(RateLimitSpec::parse).transpose()?;

    Ok(InitOnce::new(move || spec.map(RateLimitSpec::build)))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use scaling_config::environment::Environment;
    use scaling_config::load::ConfigLoader;
    use scaling_config::shared::{BLOCK_QUEUE_SIZE_KEY, DEFAULT_WORKER_THREADS};

    use super::*;
    use crate::concurrency::shutdown::create_shutdown_channel;
    use crate::error::ErrorKind;
    use crate::ratelimit::QPS_RATE_LIMITER;

    #[test]
    fn absent_blocks_are_filled_with_defaults() {
        let context = ProcessContext::new("j1", ProcessConfig::default()).unwrap();

        assert_eq!(context.input_config().worker_threads, DEFAULT_WORKER_THREADS);
        assert_eq!(context.output_config().worker_threads, DEFAULT_WORKER_THREADS);
        assert_eq!(context.channel_creator().algorithm_type(), "MEMORY");
        assert!(context.input_rate_limiter().is_none());
        assert!(context.output_rate_limiter().is_none());
    }

    #[test]
    fn unknown_algorithms_fail_construction() {
        let config = ProcessConfig {
            stream_channel: Some(AlgorithmConfig::new("DISRUPTOR")),
            ..Default::default()
        };
        let err = ProcessContext::new("j1", config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownAlgorithm);

        let config = ProcessConfig {
            output: Some(OutputConfig {
                rate_limiter: Some(AlgorithmConfig::new("TPS_MAYBE")),
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = ProcessContext::new("j1", config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownAlgorithm);
    }

    #[test]
    fn context_is_built_from_layered_configuration_files() {
        let directory = tempfile::Builder::new()
            .prefix("scaling-context-")
            .tempdir()
            .unwrap();
        fs::write(
            directory.path().join("base.yaml"),
            "input:\n  workerThreads: 8\n  batchSize: 500\noutput:\n  batchSize: 400\n",
        )
        .unwrap();
        fs::write(
            directory.path().join("dev.yaml"),
            "input:\n  rateLimiter:\n    type: QPS\n    props:\n      qps: 20\n\
             output:\n  workerThreads: 6\n\
             streamChannel:\n  type: MEMORY\n  props:\n    block-queue-size: 64\n",
        )
        .unwrap();

        let config = ConfigLoader::new(directory.path(), Environment::Dev)
            .with_env_vars([("APP_INPUT__WORKER_THREADS", "2")])
            .load::<ProcessConfig>()
            .unwrap();
        let context = ProcessContext::new("j1", config).unwrap();

        assert_eq!(context.input_config().worker_threads, 2);
        assert_eq!(context.input_config().batch_size, 500);
        assert_eq!(context.output_config().worker_threads, 6);
        assert_eq!(context.output_config().batch_size, 400);
        assert_eq!(
            context.config().stream_channel.prop(BLOCK_QUEUE_SIZE_KEY),
            Some("64")
        );
        assert_eq!(
            context.input_rate_limiter().unwrap().algorithm_type(),
            QPS_RATE_LIMITER
        );
        assert!(context.output_rate_limiter().is_none());
    }

    #[test]
    fn rate_limiters_are_built_on_first_use_only() {
        let config = ProcessConfig {
            input: Some(InputConfig {
                rate_limiter: Some(AlgorithmConfig::new("QPS").with_prop("qps", "100")),
                ..Default::default()
            }),
            ..Default::default()
        };
        let context = ProcessContext::new("j1", config).unwrap();
        assert!(!context.input_rate_limiter.is_initialized());

        let first = context.input_rate_limiter().unwrap();
        let second = context.input_rate_limiter().unwrap();

        assert_eq!(first.algorithm_type(), QPS_RATE_LIMITER);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn engines_are_built_once_and_named_after_the_job() {
        let config = ProcessConfig {
            input: Some(InputConfig {
                worker_threads: 3,
                ..Default::default()
            }),
            stream_channel: Some(
                AlgorithmConfig::new("MEMORY").with_prop(BLOCK_QUEUE_SIZE_KEY, "8"),
            ),
            ..Default::default()
        };
        let context = ProcessContext::new("j1", config).unwrap();
        assert!(!context.inventory_engine.is_initialized());

        let engine = context.inventory_dumper_engine();
        assert_eq!(engine.name(), "Inventory-j1");
        assert_eq!(engine.worker_threads(), Some(3));
        assert!(std::ptr::eq(engine, context.inventory_dumper_engine()));

        assert_eq!(context.incremental_dumper_engine().worker_threads(), None);
        assert!(!context.importer_engine.is_initialized());

        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let channel = context.create_channel(shutdown_rx);
        assert!(channel.acked_position().is_none());

        context.shutdown().await;
        assert!(context.inventory_dumper_engine().is_shut_down());
        assert!(!context.importer_engine.is_initialized());
    }
}
