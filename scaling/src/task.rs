//! Wiring of a dumper, a channel and an importer into one unit of work.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::concurrency::shutdown::ShutdownTx;
use crate::context::ProcessContext;
use crate::dumper::{
    ChangeStreamSource, IncrementalDumper, IncrementalDumperConfig, InventoryDumper,
    InventorySource,
};
use crate::engine::ExecuteHandle;
use crate::error::{ErrorKind, ScalingResult};
use crate::importer::{ImportTarget, Importer, ImporterConfig, ImporterDialect, SqlBuilder};
use crate::progress::{JobProgressStore, JobProgressTracker};
use crate::types::DataNode;

/// Dumper and importer halves of a running task.
#[derive(Debug)]
struct TaskHandles {
    name: String,
    dumper: ExecuteHandle,
    importer: ExecuteHandle,
}

impl TaskHandles {
    /// Waits for both halves and returns the failure that stopped the task, if any.
    ///
    /// A half cancelled because the other one failed reports [`ErrorKind::TaskCancelled`], so
    /// the original failure takes precedence over it.
    async fn wait(self) -> ScalingResult<()> {
        let (dumper, importer) = tokio::join!(self.dumper.join(), self.importer.join());

        let mut errors = [dumper.err(), importer.err()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>();
        errors.sort_by_key(|err| err.kind() == ErrorKind::TaskCancelled);

        match errors.into_iter().next() {
            Some(err) => {
                warn!(task = %self.name, error = %err, "task failed");
                Err(err)
            }
            None => {
                info!(task = %self.name, "task completed");
                Ok(())
            }
        }
    }
}

/// Collaborators shared by the tasks of one job.
#[derive(Debug)]
pub struct TaskResources<'a, T, S> {
    pub context: &'a ProcessContext,
    pub target: T,
    pub dialect: Arc<dyn ImporterDialect>,
    pub tracker: JobProgressTracker<S>,
    /// Stop signal of the job. A task failure sends it to stop the rest of the job.
    pub shutdown_tx: ShutdownTx,
}

/// Copies the existing rows of one table.
///
/// Completes once the importer applied the table's finished marker.
#[derive(Debug)]
pub struct InventoryTask {
    data_node: DataNode,
    handles: TaskHandles,
}

impl InventoryTask {
    /// Starts the task on the inventory and import engines of the context.
    ///
    /// Returns `None` when the checkpoint records the table as finished.
    pub async fn start<Src, T, S>(
        resources: TaskResources<'_, T, S>,
        data_node: DataNode,
        table_name: impl Into<String>,
        source: Src,
    ) -> Option<Self>
    where
        Src: InventorySource + Send + Sync + 'static,
        T: ImportTarget + Send + Sync + 'static,
        S: JobProgressStore + Send + Sync + 'static,
    {
        let TaskResources {
            context,
            target,
            dialect,
            tracker,
            shutdown_tx,
        } = resources;

        let Some(start) = tracker.inventory_start(&data_node).await else {
            info!(table = %data_node, "inventory already finished, skipping");
            return None;
        };

        let name = format!("inventory-{data_node}");
        let shutdown_rx = shutdown_tx.subscribe();
        let channel = context.create_channel(shutdown_rx.clone());

        let dumper = InventoryDumper::new(
            data_node.clone(),
            table_name,
            start,
            context.input_config().batch_size,
            source,
            channel.clone(),
            shutdown_rx.clone(),
        );
        let importer = Importer::new(
            importer_config(context, &data_node.data_source_name),
            SqlBuilder::new(dialect),
            target,
            channel,
            tracker,
            context.output_rate_limiter(),
            shutdown_rx,
        );

        let dumper_tx = shutdown_tx.clone();
        let dumper = context.inventory_dumper_engine().submit(
            format!("{name}-dumper"),
            async move { stop_on_failure(dumper.run().await.map(|_| ()), &dumper_tx) },
        );
        let importer = context.importer_engine().submit(
            format!("{name}-importer"),
            async move { stop_on_failure(importer.run().await.map(|_| ()), &shutdown_tx) },
        );

        Some(Self {
            data_node,
            handles: TaskHandles {
                name,
                dumper,
                importer,
            },
        })
    }

    pub fn data_node(&self) -> &DataNode {
        &self.data_node
    }

    /// Waits until the table was copied, the job stopped, or either half failed.
    pub async fn wait(self) -> ScalingResult<()> {
        self.handles.wait().await
    }
}

/// Follows the change stream of one data source until the job stops.
#[derive(Debug)]
pub struct IncrementalTask {
    data_source_name: String,
    handles: TaskHandles,
}

impl IncrementalTask {
    /// Starts the task on the incremental and import engines of the context.
    ///
    /// The stream resumes after the checkpointed position. `logical_tables` maps actual table
    /// names to the logical tables written on the target.
    pub async fn start<Src, T, S>(
        resources: TaskResources<'_, T, S>,
        data_source_name: impl Into<String>,
        logical_tables: HashMap<String, String>,
        source: Src,
    ) -> Self
    where
        Src: ChangeStreamSource + Send + Sync + 'static,
        T: ImportTarget + Send + Sync + 'static,
        S: JobProgressStore + Send + Sync + 'static,
    {
        let TaskResources {
            context,
            target,
            dialect,
            tracker,
            shutdown_tx,
        } = resources;

        let data_source_name = data_source_name.into();
        let start = tracker
            .snapshot()
            .await
            .incremental
            .filter(|incremental| incremental.data_source_name == data_source_name)
            .map(|incremental| incremental.position);

        let name = format!("incremental-{data_source_name}");
        let shutdown_rx = shutdown_tx.subscribe();
        let channel = context.create_channel(shutdown_rx.clone());
        let input = context.input_config();

        let dumper = IncrementalDumper::new(
            IncrementalDumperConfig {
                data_source_name: data_source_name.clone(),
                logical_tables,
                batch_size: input.batch_size,
                max_fill: input.max_fill(),
                reconnection: input.reconnection.clone(),
            },
            start,
            source,
            channel.clone(),
            shutdown_rx.clone(),
        );
        let importer = Importer::new(
            importer_config(context, &data_source_name),
            SqlBuilder::new(dialect),
            target,
            channel,
            tracker,
            context.output_rate_limiter(),
            shutdown_rx,
        );

        let dumper_tx = shutdown_tx.clone();
        let dumper = context.incremental_dumper_engine().submit(
            format!("{name}-dumper"),
            async move { stop_on_failure(dumper.run().await, &dumper_tx) },
        );
        let importer = context.importer_engine().submit(
            format!("{name}-importer"),
            async move { stop_on_failure(importer.run().await.map(|_| ()), &shutdown_tx) },
        );

        Self {
            data_source_name,
            handles: TaskHandles {
                name,
                dumper,
                importer,
            },
        }
    }

    pub fn data_source_name(&self) -> &str {
        &self.data_source_name
    }

    /// Waits until the job stopped or either half failed.
    pub async fn wait(self) -> ScalingResult<()> {
        self.handles.wait().await
    }
}

fn importer_config(context: &ProcessContext, data_source_name: &str) -> ImporterConfig {
    let output = context.output_config();

    ImporterConfig {
        data_source_name: data_source_name.to_string(),
        batch_size: output.batch_size,
        fetch_timeout: output.fetch_timeout(),
        retry: output.retry.clone(),
    }
}

/// Broadcasts the stop signal when `result` is a failure, so the other half does not wait on a
/// peer that is gone.
fn stop_on_failure(result: ScalingResult<()>, shutdown_tx: &ShutdownTx) -> ScalingResult<()> {
    if result.is_err() {
        shutdown_tx.shutdown();
    }

    result
}
