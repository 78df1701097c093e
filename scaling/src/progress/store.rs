use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::ScalingResult;
use crate::progress::model::JobProgress;
use crate::progress::yaml::{from_yaml, to_yaml};

/// Persistent home of job checkpoints, usually a node of the coordination service.
///
/// Checkpoints are keyed by job id and sharding item, since the items of one job progress
/// independently.
pub trait JobProgressStore {
    /// Loads the checkpoint of a sharding item, `None` when the item never persisted one.
    fn load_job_progress(
        &self,
        job_id: &str,
        sharding_item: u32,
    ) -> impl Future<Output = ScalingResult<Option<JobProgress>>> + Send;

    /// Replaces the checkpoint of a sharding item.
    fn persist_job_progress(
        &self,
        job_id: &str,
        sharding_item: u32,
        progress: &JobProgress,
    ) -> impl Future<Output = ScalingResult<()>> + Send;
}

#[derive(Debug, Default)]
struct Inner {
    documents: HashMap<(String, u32), String>,
    persist_count: u64,
}

/// Keeps checkpoints in memory, encoded exactly as they would be stored remotely.
#[derive(Debug, Clone, Default)]
pub struct MemoryJobProgressStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryJobProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stored YAML document of a sharding item.
    pub async fn document(&self, job_id: &str, sharding_item: u32) -> Option<String> {
        let inner = self.inner.lock().await;

        inner
            .documents
            .get(&(job_id.to_string(), sharding_item))
            .cloned()
    }

    /// Stores a raw document, for example one written by another process.
    pub async fn insert_document(&self, job_id: &str, sharding_item: u32, document: String) {
        let mut inner = self.inner.lock().await;
        inner
            .documents
            .insert((job_id.to_string(), sharding_item), document);
    }

    /// Number of successful persists since the store was created.
    pub async fn persist_count(&self) -> u64 {
        self.inner.lock().await.persist_count
    }
}

impl JobProgressStore for MemoryJobProgressStore {
    async fn load_job_progress(
        &self,
        job_id: &str,
        sharding_item: u32,
    ) -> ScalingResult<Option<JobProgress>> {
        let inner = self.inner.lock().await;

        inner
            .documents
            .get(&(job_id.to_string(), sharding_item))
            .map(|document| from_yaml(document))
            .transpose()
    }

    async fn persist_job_progress(
        &self,
        job_id: &str,
        sharding_item: u32,
        progress: &JobProgress,
    ) -> ScalingResult<()> {
        let document = to_yaml(progress)?;

        let mut inner = self.inner.lock().await;
        inner
            .documents
            .insert((job_id.to_string(), sharding_item), document);
        inner.persist_count += 1;

        Ok(())
    }
}
