use std::sync::Arc;
use std::time::Duration;

use scaling_config::shared::RetryConfig;
use tracing::{debug, error, info, warn};

use crate::channel::PipelineChannel;
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ErrorKind, ScalingError, ScalingResult};
#[cfg(feature = "failpoints")]
use crate::failpoints::{BEFORE_CHANNEL_ACK_FP, BEFORE_CHECKPOINT_PERSIST_FP, scaling_fail_point};
use crate::importer::sql::{SqlBuilder, SqlStatement};
use crate::importer::target::ImportTarget;
use crate::progress::{JobProgressStore, JobProgressTracker};
use crate::ratelimit::RateLimiter;
use crate::scaling_error;
use crate::types::{DataNode, DataRecord, Position, Record};

/// Tuning of an [`Importer`].
#[derive(Debug, Clone)]
pub struct ImporterConfig {
    /// Data source whose change stream position is checkpointed.
    pub data_source_name: String,
    pub batch_size: usize,
    pub fetch_timeout: Duration,
    pub retry: RetryConfig,
}

/// How an import ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportResult {
    /// The finished marker of the table was applied.
    Finished { records: u64 },
    /// The stop signal arrived first.
    Stopped { records: u64 },
}

/// Records of one batch that are applied to the same table in one transaction.
#[derive(Debug)]
struct TableGroup<'a> {
    table_name: &'a str,
    records: Vec<&'a DataRecord>,
}

/// Applies the records of one channel to the target.
///
/// Each fetched batch is applied, then checkpointed, then acknowledged, in that order. A stop
/// signal lets the batch in flight complete before the importer returns.
#[derive(Debug)]
pub struct Importer<T, S> {
    config: ImporterConfig,
    builder: SqlBuilder,
    target: T,
    channel: Arc<dyn PipelineChannel>,
    tracker: JobProgressTracker<S>,
    rate_limiter: Option<RateLimiter>,
    shutdown_rx: ShutdownRx,
    last_checkpoint: Option<Position>,
    applied: u64,
}

impl<T, S> Importer<T, S>
where
    T: ImportTarget + Send + Sync,
    S: JobProgressStore + Send + Sync,
{
    pub fn new(
        config: ImporterConfig,
        builder: SqlBuilder,
        target: T,
        channel: Arc<dyn PipelineChannel>,
        tracker: JobProgressTracker<S>,
        rate_limiter: Option<RateLimiter>,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        let last_checkpoint = channel.acked_position();

        Self {
            config,
            builder,
            target,
            channel,
            tracker,
            rate_limiter,
            shutdown_rx,
            last_checkpoint,
            applied: 0,
        }
    }

    /// Imports until the finished marker is applied or the stop signal arrives.
    pub async fn run(mut self) -> ScalingResult<ImportResult> {
        info!(
            job_id = %self.tracker.job_id(),
            dialect = %self.builder.dialect().database_type(),
            batch_size = self.config.batch_size,
            "importer started"
        );

        loop {
            if self.shutdown_rx.is_shutdown() {
                return Ok(self.stopped());
            }

            let records = self
                .channel
                .fetch_records(self.config.batch_size, self.config.fetch_timeout)
                .await;
            if records.is_empty() {
                continue;
            }

            match self.import_batch(records).await? {
                BatchOutcome::Applied => {}
                BatchOutcome::Finished => {
                    info!(
                        job_id = %self.tracker.job_id(),
                        records = self.applied,
                        "importer finished"
                    );
                    return Ok(ImportResult::Finished {
                        records: self.applied,
                    });
                }
                BatchOutcome::Stopped => return Ok(self.stopped()),
            }
        }
    }

    async fn import_batch(&mut self, records: Vec<Record>) -> ScalingResult<BatchOutcome> {
        let (applicable, dropped) = up_to_finished(&records);
        let finished = match applicable.last() {
            Some(Record::Finished(finished)) => Some(finished),
            _ => None,
        };
        if let Some(finished) = finished.filter(|_| dropped > 0) {
            warn!(
                job_id = %self.tracker.job_id(),
                table = %finished.data_node,
                dropped,
                "records after the finished marker were dropped"
            );
        }

        for group in group_by_table(applicable) {
            if !self.apply_group(&group).await? {
                return Ok(BatchOutcome::Stopped);
            }
            self.applied += group.records.len() as u64;
        }

        let Some(last) = applicable.last() else {
            return Ok(BatchOutcome::Applied);
        };
        let position = last.position().clone();

        #[cfg(feature = "failpoints")]
        scaling_fail_point(BEFORE_CHECKPOINT_PERSIST_FP)?;

        match last {
            Record::Finished(finished) => {
                self.tracker
                    .finish_inventory_table(&finished.data_node)
                    .await?;
            }
            _ => self.checkpoint(applicable, &position).await?,
        }
        self.last_checkpoint = Some(position.clone());

        #[cfg(feature = "failpoints")]
        scaling_fail_point(BEFORE_CHANNEL_ACK_FP)?;

        debug!(
            job_id = %self.tracker.job_id(),
            records = applicable.len(),
            %position,
            "batch applied and checkpointed"
        );
        self.channel.ack(position);

        if finished.is_some() {
            return Ok(BatchOutcome::Finished);
        }

        Ok(BatchOutcome::Applied)
    }

    async fn checkpoint(&self, records: &[Record], position: &Position) -> ScalingResult<()> {
        match position {
            Position::Inventory(position) => {
                let Some(data_node) = last_data_node(records) else {
                    return Ok(());
                };

                self.tracker
                    .update_inventory_position(data_node, position.clone())
                    .await
            }
            Position::Stream(position) => {
                self.tracker
                    .update_incremental_position(&self.config.data_source_name, position.clone())
                    .await
            }
        }
    }

    /// Applies one group with bounded retries. Returns `false` when the stop signal interrupted
    /// a retry backoff.
    async fn apply_group(&self, group: &TableGroup<'_>) -> ScalingResult<bool> {
        let statements = group
            .records
            .iter()
            .map(|record| self.builder.build(record))
            .collect::<ScalingResult<Vec<SqlStatement>>>()
            .map_err(|err| self.fatal(group, "Record cannot be applied", err))?;

        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            if let Some(rate_limiter) = &self.rate_limiter {
                rate_limiter.acquire(1).await;
            }

            let err = match self.target.execute(&statements).await {
                Ok(affected) => {
                    debug!(
                        table = group.table_name,
                        statements = statements.len(),
                        affected,
                        "group applied"
                    );
                    return Ok(true);
                }
                Err(err) => err,
            };

            if !err.is_transient() {
                return Err(self.fatal(group, "Batch failed with a non retryable error", err));
            }

            if attempt >= max_attempts {
                let err = scaling_error!(
                    ErrorKind::ImportRetriesExhausted,
                    "Batch could not be applied within the retry budget",
                    format!("{max_attempts} attempts"),
                    source: err
                );
                return Err(self.fatal(group, "Import retries exhausted", err));
            }

            let delay = self.config.retry.delay_for_retry(attempt);
            warn!(
                table = group.table_name,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "batch apply failed, retrying"
            );
            attempt += 1;

            let mut shutdown_rx = self.shutdown_rx.clone();
            tokio::select! {
                biased;

                _ = shutdown_rx.wait() => return Ok(false),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Builds the error that ends the job, carrying the last checkpointed position.
    fn fatal(
        &self,
        group: &TableGroup<'_>,
        description: &'static str,
        err: ScalingError,
    ) -> ScalingError {
        let checkpoint = self
            .last_checkpoint
            .as_ref()
            .map(|position| position.to_string())
            .unwrap_or_else(|| "none".to_string());
        let first = group
            .records
            .first()
            .map(|record| record.position.to_string())
            .unwrap_or_default();

        error!(
            job_id = %self.tracker.job_id(),
            table = group.table_name,
            batch_size = group.records.len(),
            position = %first,
            checkpoint = %checkpoint,
            error = %err,
            "import failed"
        );

        scaling_error!(
            err.kind(),
            description,
            format!(
                "table {}, {} records from position `{first}`, last checkpoint `{checkpoint}`",
                group.table_name,
                group.records.len()
            ),
            source: err
        )
    }

    fn stopped(&self) -> ImportResult {
        info!(
            job_id = %self.tracker.job_id(),
            records = self.applied,
            "importer stopped"
        );
        ImportResult::Stopped {
            records: self.applied,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchOutcome {
    Applied,
    Finished,
    Stopped,
}

/// Cuts `records` after the first finished marker, since nothing after it belongs to the table.
/// Returns the records to apply and how many were cut.
fn up_to_finished(records: &[Record]) -> (&[Record], usize) {
    match records.iter().position(Record::is_finished) {
        Some(index) => (&records[..=index], records.len() - index - 1),
        None => (records, 0),
    }
}

/// Splits `records` into runs of consecutive data records targeting the same table.
fn group_by_table(records: &[Record]) -> Vec<TableGroup<'_>> {
    let mut groups: Vec<TableGroup<'_>> = Vec::new();

    for record in records {
        let Record::Data(data) = record else {
            continue;
        };

        match groups.last_mut() {
            Some(group) if group.table_name == data.table_name => group.records.push(data),
            _ => groups.push(TableGroup {
                table_name: &data.table_name,
                records: vec![data],
            }),
        }
    }

    groups
}

fn last_data_node(records: &[Record]) -> Option<&DataNode> {
    records.iter().rev().find_map(|record| match record {
        Record::Data(data) => Some(&data.data_node),
        Record::Finished(finished) => Some(&finished.data_node),
        Record::Placeholder(_) => None,
    })
}
