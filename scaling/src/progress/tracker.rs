use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{ScalingError, ScalingResult};
use crate::progress::model::{IncrementalProgress, JobProgress, JobStatus};
use crate::progress::store::JobProgressStore;
use crate::types::{DataNode, InventoryPosition, StreamPosition};

/// Single writer of a job's checkpoint.
///
/// Every mutation is persisted before it becomes visible, so the in-memory progress never runs
/// ahead of the stored one. Readers take snapshots under the read lock.
#[derive(Debug)]
pub struct JobProgressTracker<S> {
    job_id: String,
    sharding_item: u32,
    store: S,
    progress: Arc<RwLock<JobProgress>>,
}

impl<S> Clone for JobProgressTracker<S>
where
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            job_id: self.job_id.clone(),
            sharding_item: self.sharding_item,
            store: self.store.clone(),
            progress: self.progress.clone(),
        }
    }
}

impl<S> JobProgressTracker<S>
where
    S: JobProgressStore + Send + Sync,
{
    /// Resumes from the stored checkpoint, or starts from `initial` when there is none.
    pub async fn load_or_init(
        job_id: impl Into<String>,
        sharding_item: u32,
        store: S,
        initial: JobProgress,
    ) -> ScalingResult<Self> {
        let job_id = job_id.into();
        let progress = match store.load_job_progress(&job_id, sharding_item).await? {
            Some(progress) => {
                info!(
                    %job_id,
                    sharding_item,
                    status = %progress.status,
                    finished = progress.inventory.finished().len(),
                    unfinished = progress.inventory.unfinished().len(),
                    "resuming from checkpoint"
                );
                progress
            }
            None => {
                store
                    .persist_job_progress(&job_id, sharding_item, &initial)
                    .await?;
                initial
            }
        };

        Ok(Self {
            job_id,
            sharding_item,
            store,
            progress: Arc::new(RwLock::new(progress)),
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn sharding_item(&self) -> u32 {
        self.sharding_item
    }

    /// Returns a copy of the current progress.
    pub async fn snapshot(&self) -> JobProgress {
        self.progress.read().await.clone()
    }

    /// Returns where the inventory dump of `data_node` has to start, `None` when it finished.
    pub async fn inventory_start(&self, data_node: &DataNode) -> Option<InventoryPosition> {
        let progress = self.progress.read().await;
        if progress.inventory.is_finished(data_node) {
            return None;
        }

        Some(
            progress
                .inventory
                .unfinished_position(data_node)
                .cloned()
                .unwrap_or(InventoryPosition::Placeholder),
        )
    }

    /// Records that the inventory of `data_node` was applied up to `position`.
    ///
    /// A position behind the recorded one, or a table that already finished, is ignored.
    pub async fn update_inventory_position(
        &self,
        data_node: &DataNode,
        position: InventoryPosition,
    ) -> ScalingResult<()> {
        self.mutate(|progress| {
            if progress.inventory.is_finished(data_node) {
                warn!(table = %data_node, %position, "ignoring position of a finished table");
                return false;
            }

            if let Some(current) = progress.inventory.unfinished_position(data_node) {
                if position < *current {
                    warn!(
                        table = %data_node,
                        current = %current,
                        %position,
                        "ignoring inventory position regression"
                    );
                    return false;
                }
            }

            debug!(table = %data_node, %position, "inventory position advanced");
            progress
                .inventory
                .set_unfinished(data_node.clone(), position.clone());
            true
        })
        .await
    }

    /// Moves `data_node` to the finished tables.
    pub async fn finish_inventory_table(&self, data_node: &DataNode) -> ScalingResult<()> {
        self.mutate(|progress| {
            if progress.inventory.is_finished(data_node) {
                return false;
            }

            info!(table = %data_node, "inventory finished");
            progress.inventory.mark_finished(data_node.clone());
            true
        })
        .await
    }

    /// Records the change stream position applied for `data_source_name`.
    ///
    /// Creates the incremental progress on first use.
    pub async fn update_incremental_position(
        &self,
        data_source_name: &str,
        position: StreamPosition,
    ) -> ScalingResult<()> {
        self.mutate(|progress| {
            let incremental = progress
                .incremental
                .get_or_insert_with(|| IncrementalProgress {
                    data_source_name: data_source_name.to_string(),
                    position: StreamPosition::default(),
                });

            if incremental.data_source_name == data_source_name
                && incremental.position == position
            {
                return false;
            }

            incremental.data_source_name = data_source_name.to_string();
            incremental.position = position.clone();
            true
        })
        .await
    }

    pub async fn set_status(&self, status: JobStatus) -> ScalingResult<()> {
        self.mutate(|progress| {
            if progress.status == status {
                return false;
            }

            info!(from = %progress.status, to = %status, "job status changed");
            progress.status = status;
            true
        })
        .await
    }

    /// Marks the job as failed and records the error.
    ///
    /// The rest of the checkpoint is left untouched, so the job can resume from it.
    pub async fn fail(&self, error: &ScalingError) -> ScalingResult<()> {
        self.mutate(|progress| {
            progress.status = JobStatus::Failed;
            progress.error_message = Some(error.to_string());
            true
        })
        .await
    }

    /// Applies `update` to a copy and persists it. The copy replaces the current progress only
    /// when it was persisted.
    async fn mutate<F>(&self, update: F) -> ScalingResult<()>
    where
        F: FnOnce(&mut JobProgress) -> bool,
    {
        let mut progress = self.progress.write().await;

        let mut next = progress.clone();
        if !update(&mut next) {
            return Ok(());
        }

        self.store
            .persist_job_progress(&self.job_id, self.sharding_item, &next)
            .await?;
        *progress = next;

        Ok(())
    }
}
