use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scaling_config::shared::MEMORY_CHANNEL_TYPE;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::debug;

use crate::channel::{PipelineChannel, PipelineChannelCreator};
use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx};
use crate::ratelimit::RateLimiter;
use crate::types::{Position, Record};

/// Channel backed by a bounded in-process queue holding at most `capacity` records.
#[derive(Debug)]
pub struct MemoryPipelineChannel {
    sender: mpsc::Sender<Record>,
    receiver: Mutex<mpsc::Receiver<Record>>,
    rate_limiter: Option<RateLimiter>,
    shutdown_rx: ShutdownRx,
    acked: watch::Sender<Option<Position>>,
}

impl MemoryPipelineChannel {
    pub fn new(capacity: usize, rate_limiter: Option<RateLimiter>, shutdown_rx: ShutdownRx) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let (acked, _) = watch::channel(None);

        Self {
            sender,
            receiver: Mutex::new(receiver),
            rate_limiter,
            shutdown_rx,
            acked,
        }
    }

    /// Number of records currently buffered.
    pub fn len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PipelineChannel for MemoryPipelineChannel {
    async fn push_records(&self, records: Vec<Record>) -> ShutdownResult<(), Vec<Record>> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        if let Some(rate_limiter) = &self.rate_limiter {
            tokio::select! {
                biased;

                _ = shutdown_rx.wait() => return ShutdownResult::Shutdown(records),
                _ = rate_limiter.acquire(1) => {}
            }
        }

        let mut records = records.into_iter();
        while let Some(record) = records.next() {
            // A slot is reserved before the record is moved, so a stop never loses it.
            let permit = tokio::select! {
                biased;

                _ = shutdown_rx.wait() => None,
                permit = self.sender.reserve() => permit.ok(),
            };

            match permit {
                Some(permit) => permit.send(record),
                None => {
                    let mut pending = vec![record];
                    pending.extend(records);
                    debug!(pending = pending.len(), "push interrupted by shutdown");

                    return ShutdownResult::Shutdown(pending);
                }
            }
        }

        ShutdownResult::Ok(())
    }

    async fn fetch_records(&self, batch_size: usize, timeout: Duration) -> Vec<Record> {
        let mut shutdown_rx = self.shutdown_rx.clone();
        if shutdown_rx.is_shutdown() {
            return Vec::new();
        }

        let mut receiver = self.receiver.lock().await;
        let first = tokio::select! {
            biased;

            _ = shutdown_rx.wait() => return Vec::new(),
            first = tokio::time::timeout(timeout, receiver.recv()) => first,
        };

        let Ok(Some(first)) = first else {
            return Vec::new();
        };

        let mut records = Vec::with_capacity(batch_size.clamp(1, 1024));
        records.push(first);
        while records.len() < batch_size {
            match receiver.try_recv() {
                Ok(record) => records.push(record),
                Err(_) => break,
            }
        }

        records
    }

    fn ack(&self, position: Position) {
        self.acked.send_replace(Some(position));
    }

    fn acked_position(&self) -> Option<Position> {
        self.acked.borrow().clone()
    }
}

/// Creates [`MemoryPipelineChannel`]s of a fixed capacity.
#[derive(Debug, Clone)]
pub struct MemoryPipelineChannelCreator {
    block_queue_size: usize,
}

impl MemoryPipelineChannelCreator {
    pub fn new(block_queue_size: usize) -> Self {
        Self { block_queue_size }
    }

    pub fn block_queue_size(&self) -> usize {
        self.block_queue_size
    }
}

impl PipelineChannelCreator for MemoryPipelineChannelCreator {
    fn algorithm_type(&self) -> &'static str {
        MEMORY_CHANNEL_TYPE
    }

    fn create(
        &self,
        rate_limiter: Option<RateLimiter>,
        shutdown_rx: ShutdownRx,
    ) -> Arc<dyn PipelineChannel> {
        Arc::new(MemoryPipelineChannel::new(
            self.block_queue_size,
            rate_limiter,
            shutdown_rx,
        ))
    }
}
