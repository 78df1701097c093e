use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{Mutex, mpsc, watch};

use crate::dumper::{
    ChangeEvent, ChangeStreamSource, InventorySource, PageRequest, SourceRow, UniqueKeyKind,
};
use crate::error::{ErrorKind, ScalingError, ScalingResult};
use crate::scaling_error;
use crate::test_utils::notify::wait_until;
use crate::types::{Cell, Column, DataNode, Operation, StreamPosition};

#[derive(Debug, Default)]
struct InventoryInner {
    tables: HashMap<DataNode, Vec<Vec<Column>>>,
    page_reads: usize,
    read_failures: VecDeque<ScalingError>,
}

/// In-memory tables served to the inventory dumper.
///
/// Rows keep their insertion order for offset pages and are sorted by key for key range pages.
#[derive(Debug, Clone, Default)]
pub struct MemoryInventorySource {
    inner: Arc<Mutex<InventoryInner>>,
}

impl MemoryInventorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_table(&self, data_node: DataNode, rows: Vec<Vec<Column>>) {
        self.inner.lock().await.tables.insert(data_node, rows);
    }

    /// Makes the next page reads fail with `errors`, one per read.
    pub async fn fail_next_reads(&self, errors: impl IntoIterator<Item = ScalingError>) {
        self.inner.lock().await.read_failures.extend(errors);
    }

    pub async fn page_reads(&self) -> usize {
        self.inner.lock().await.page_reads
    }
}

fn unique_key(row: &[Column]) -> Option<&Cell> {
    row.iter()
        .find(|column| column.unique_key)
        .map(|column| &column.value)
}

impl InventorySource for MemoryInventorySource {
    async fn unique_key_kind(&self, data_node: &DataNode) -> ScalingResult<UniqueKeyKind> {
        let inner = self.inner.lock().await;
        let rows = inner.tables.get(data_node).ok_or_else(|| {
            scaling_error!(
                ErrorKind::SourceQueryFailed,
                "Table does not exist",
                data_node.to_string()
            )
        })?;

        // An empty table has nothing to page through either way.
        let Some(row) = rows.first() else {
            return Ok(UniqueKeyKind::Integer);
        };

        Ok(match unique_key(row) {
            Some(Cell::I64(_)) => UniqueKeyKind::Integer,
            Some(Cell::String(_)) => UniqueKeyKind::String,
            _ => UniqueKeyKind::None,
        })
    }

    async fn read_page(
        &self,
        data_node: &DataNode,
        request: &PageRequest,
        limit: usize,
    ) -> ScalingResult<Vec<SourceRow>> {
        let mut inner = self.inner.lock().await;
        inner.page_reads += 1;
        if let Some(err) = inner.read_failures.pop_front() {
            return Err(err);
        }

        let rows = inner.tables.get(data_node).ok_or_else(|| {
            scaling_error!(
                ErrorKind::SourceQueryFailed,
                "Table does not exist",
                data_node.to_string()
            )
        })?;

        let page = match request {
            PageRequest::KeyRange { from, to } => {
                let mut keyed = rows
                    .iter()
                    .filter_map(|row| unique_key(row)?.as_i64().map(|key| (key, row)))
                    .filter(|(key, _)| {
                        from.is_none_or(|from| *key >= from) && to.is_none_or(|to| *key <= to)
                    })
                    .collect::<Vec<_>>();
                keyed.sort_by_key(|(key, _)| *key);

                keyed
                    .into_iter()
                    .take(limit)
                    .map(|(_, row)| SourceRow::new(row.clone()))
                    .collect()
            }
            PageRequest::Offset(offset) => rows
                .iter()
                .skip(*offset as usize)
                .take(limit)
                .map(|row| SourceRow::new(row.clone()))
                .collect(),
        };

        Ok(page)
    }
}

type EventSender = mpsc::UnboundedSender<ScalingResult<ChangeEvent>>;

#[derive(Debug, Default)]
struct ChangeLogInner {
    events: Vec<ChangeEvent>,
    next_sequence: u64,
    subscribers: Vec<EventSender>,
    open_failures: VecDeque<ScalingError>,
    opened_after: Vec<Option<StreamPosition>>,
}

/// In-memory change log served to the incremental dumper.
///
/// Positions are zero padded sequence numbers, so they order like the events. Opening without a
/// position starts at the current end of the log, like a real source does.
#[derive(Debug, Clone)]
pub struct MemoryChangeStream {
    inner: Arc<Mutex<ChangeLogInner>>,
    opens: Arc<watch::Sender<usize>>,
}

impl Default for MemoryChangeStream {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChangeStream {
    pub fn new() -> Self {
        let (opens, _) = watch::channel(0);

        Self {
            inner: Arc::new(Mutex::new(ChangeLogInner::default())),
            opens: Arc::new(opens),
        }
    }

    /// Appends a row change and delivers it to every open stream. Returns its position.
    pub async fn append_row(
        &self,
        data_node: DataNode,
        operation: Operation,
        columns: Vec<Column>,
    ) -> StreamPosition {
        self.append(|position| ChangeEvent::Row {
            data_node,
            operation,
            columns,
            position,
        })
        .await
    }

    pub async fn append_heartbeat(&self) -> StreamPosition {
        self.append(|position| ChangeEvent::Heartbeat { position }).await
    }

    async fn append<F>(&self, event: F) -> StreamPosition
    where
        F: FnOnce(StreamPosition) -> ChangeEvent,
    {
        let mut inner = self.inner.lock().await;
        inner.next_sequence += 1;
        let position = StreamPosition::new(format!("{:012}", inner.next_sequence));

        let event = event(position.clone());
        inner.events.push(event.clone());
        inner
            .subscribers
            .retain(|subscriber| subscriber.send(Ok(event.clone())).is_ok());

        position
    }

    /// Ends every open stream, as a dropped connection does.
    pub async fn disconnect(&self) {
        self.inner.lock().await.subscribers.clear();
    }

    /// Delivers `error` on every open stream and ends them.
    pub async fn fail_streams(&self, error: ScalingError) {
        let mut inner = self.inner.lock().await;
        for subscriber in inner.subscribers.drain(..) {
            let _ = subscriber.send(Err(error.clone()));
        }
    }

    /// Delivers a corrupted event on every open stream.
    pub async fn corrupt(&self) {
        self.fail_streams(scaling_error!(
            ErrorKind::SourceReplicationCorrupted,
            "Change event checksum mismatch"
        ))
        .await;
    }

    /// Makes the next opens fail with `errors`, one per open.
    pub async fn fail_next_opens(&self, errors: impl IntoIterator<Item = ScalingError>) {
        self.inner.lock().await.open_failures.extend(errors);
    }

    /// Positions the stream was opened after, one entry per successful open.
    pub async fn opened_after(&self) -> Vec<Option<StreamPosition>> {
        self.inner.lock().await.opened_after.clone()
    }

    /// Waits until the stream was opened successfully `count` times.
    pub async fn wait_for_opens(&self, count: usize) {
        let mut rx = self.opens.subscribe();
        wait_until(&mut rx, |opens| *opens >= count).await;
    }
}

impl ChangeStreamSource for MemoryChangeStream {
    type Stream = ChangeEventStream;

    async fn open(&self, after: Option<StreamPosition>) -> ScalingResult<Self::Stream> {
        let mut inner = self.inner.lock().await;
        if let Some(err) = inner.open_failures.pop_front() {
            return Err(err);
        }

        let start = match &after {
            None => inner.events.len(),
            Some(after) => match inner.events.iter().position(|event| event.position() == after) {
                Some(index) => index + 1,
                None => {
                    return Err(scaling_error!(
                        ErrorKind::SourceReplicationCorrupted,
                        "Position is not in the change log",
                        after.to_string()
                    ));
                }
            },
        };

        let (tx, rx) = mpsc::unbounded_channel();
        for event in &inner.events[start..] {
            let _ = tx.send(Ok(event.clone()));
        }
        inner.subscribers.push(tx);
        inner.opened_after.push(after);
        drop(inner);

        self.opens.send_modify(|opens| *opens += 1);

        Ok(ChangeEventStream { rx })
    }
}

/// Stream handed out by [`MemoryChangeStream::open`].
#[derive(Debug)]
pub struct ChangeEventStream {
    rx: mpsc::UnboundedReceiver<ScalingResult<ChangeEvent>>,
}

impl Stream for ChangeEventStream {
    type Item = ScalingResult<ChangeEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
