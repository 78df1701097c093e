use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use scaling_config::shared::ReconnectionConfig;
use tracing::{debug, error, info, warn};

use crate::channel::PipelineChannel;
use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx};
use crate::concurrency::stream::BatchStream;
use crate::dumper::reconnect::ReconnectionManager;
use crate::dumper::source::{ChangeEvent, ChangeStreamSource};
use crate::error::{ErrorKind, ScalingError, ScalingResult};
use crate::scaling_error;
use crate::types::{DataRecord, PlaceholderRecord, Position, Record, StreamPosition};

/// Tuning of an [`IncrementalDumper`].
#[derive(Debug, Clone)]
pub struct IncrementalDumperConfig {
    pub data_source_name: String,
    /// Maps actual table names to the logical tables written on the target. Unmapped tables keep
    /// their name.
    pub logical_tables: HashMap<String, String>,
    pub batch_size: usize,
    pub max_fill: Duration,
    pub reconnection: ReconnectionConfig,
}

/// Streams source changes into a channel until it is stopped.
///
/// A dropped connection is recovered by reopening the stream after the last change that was
/// pushed, so nothing is skipped and nothing already in the channel is read twice. Any other
/// stream error ends the dumper with that error.
#[derive(Debug)]
pub struct IncrementalDumper<S> {
    config: IncrementalDumperConfig,
    start: Option<StreamPosition>,
    source: S,
    channel: Arc<dyn PipelineChannel>,
    shutdown_rx: ShutdownRx,
}

impl<S> IncrementalDumper<S>
where
    S: ChangeStreamSource + Send + Sync,
{
    /// `start` is the checkpointed position. An empty or absent position starts at the current
    /// end of the change log.
    pub fn new(
        config: IncrementalDumperConfig,
        start: Option<StreamPosition>,
        source: S,
        channel: Arc<dyn PipelineChannel>,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            config,
            start: start.filter(|position| !position.is_empty()),
            source,
            channel,
            shutdown_rx,
        }
    }

    /// Runs until the stop signal. Returns an error only for failures that cannot be recovered.
    pub async fn run(self) -> ScalingResult<()> {
        let mut manager = ReconnectionManager::new(self.config.reconnection.clone());
        let data_source = self.config.data_source_name.clone();
        let mut last_pushed = None;

        info!(%data_source, start = ?self.start, "incremental dump started");

        loop {
            if self.shutdown_rx.is_shutdown() {
                break;
            }

            let resume_from = self.resume_position(last_pushed.as_ref());
            let err = match self
                .stream_from(resume_from.clone(), &mut manager, &mut last_pushed)
                .await
            {
                Ok(()) => break,
                Err(err) => err,
            };

            if !manager.should_retry(&err) {
                if err.kind().is_connection_loss() {
                    error!(
                        %data_source,
                        attempts = manager.attempt_count(),
                        resume_from = ?resume_from,
                        "reconnection failed, giving up"
                    );
                } else {
                    error!(
                        %data_source,
                        error = %err,
                        resume_from = ?resume_from,
                        "incremental dump failed"
                    );
                }

                return Err(err);
            }

            manager.record_failure(err.clone());
            let delay = manager.next_backoff();
            warn!(
                %data_source,
                error = %err,
                attempt = manager.attempt_count(),
                delay_ms = delay.as_millis() as u64,
                resume_from = ?resume_from,
                "change stream lost, reconnecting"
            );

            let mut shutdown_rx = self.shutdown_rx.clone();
            tokio::select! {
                biased;

                _ = shutdown_rx.wait() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(%data_source, "incremental dump stopped");

        Ok(())
    }

    /// The position of the last pushed change, or the start position when nothing was pushed
    /// yet.
    fn resume_position(&self, last_pushed: Option<&StreamPosition>) -> Option<StreamPosition> {
        last_pushed.or(self.start.as_ref()).cloned()
    }

    /// Streams until the stop signal, returning `Ok`, or until the stream fails.
    async fn stream_from(
        &self,
        after: Option<StreamPosition>,
        manager: &mut ReconnectionManager,
        last_pushed: &mut Option<StreamPosition>,
    ) -> ScalingResult<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        let stream = tokio::select! {
            biased;

            _ = shutdown_rx.wait() => return Ok(()),
            stream = self.source.open(after.clone()) => stream?,
        };

        if manager.attempt_count() > 0 {
            info!(
                data_source = %self.config.data_source_name,
                resume_from = ?after,
                downtime_ms = manager.outage_duration().unwrap_or_default().as_millis() as u64,
                "change stream reconnected"
            );
        }
        manager.record_success();

        let batches = BatchStream::wrap(stream, self.config.batch_size, self.config.max_fill);
        tokio::pin!(batches);

        loop {
            let batch = tokio::select! {
                biased;

                _ = shutdown_rx.wait() => return Ok(()),
                batch = batches.next() => batch,
            };

            let Some(batch) = batch else {
                return Err(scaling_error!(
                    ErrorKind::SourceConnectionFailed,
                    "Change stream ended unexpectedly",
                    self.config.data_source_name.clone()
                ));
            };

            let mut records = Vec::with_capacity(batch.len());
            let mut batch_position = None;
            let mut failure = None;
            for event in batch {
                match event {
                    Ok(event) => {
                        batch_position = Some(event.position().clone());
                        records.push(self.to_record(event));
                    }
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }

            // Changes read before a failure are still delivered.
            if !records.is_empty() {
                let count = records.len();
                if let ShutdownResult::Shutdown(_) = self.channel.push_records(records).await {
                    return Ok(());
                }
                *last_pushed = batch_position;
                debug!(
                    data_source = %self.config.data_source_name,
                    count,
                    position = ?last_pushed,
                    "change batch pushed"
                );
            }

            if let Some(err) = failure {
                return Err(self.classify(err));
            }
        }
    }

    fn to_record(&self, event: ChangeEvent) -> Record {
        match event {
            ChangeEvent::Row {
                data_node,
                operation,
                columns,
                position,
            } => {
                let table_name = self
                    .config
                    .logical_tables
                    .get(&data_node.table_name)
                    .cloned()
                    .unwrap_or_else(|| data_node.table_name.clone());

                Record::Data(DataRecord {
                    data_node,
                    table_name,
                    operation,
                    columns,
                    position: Position::Stream(position),
                })
            }
            ChangeEvent::Heartbeat { position } => Record::Placeholder(PlaceholderRecord {
                position: Position::Stream(position),
            }),
        }
    }

    /// Keeps connection losses recoverable. Everything else the stream reports is treated as a
    /// broken replication.
    fn classify(&self, err: ScalingError) -> ScalingError {
        if err.kind().is_connection_loss() || err.kind() == ErrorKind::SourceReplicationCorrupted {
            return err;
        }

        scaling_error!(
            ErrorKind::SourceReplicationCorrupted,
            "Change stream failed",
            self.config.data_source_name.clone(),
            source: err
        )
    }
}
