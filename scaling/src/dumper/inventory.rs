use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::channel::PipelineChannel;
use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx};
use crate::dumper::source::{InventorySource, PageRequest, SourceRow, UniqueKeyKind};
use crate::error::{ErrorKind, ScalingResult};
#[cfg(feature = "failpoints")]
use crate::failpoints::{INVENTORY_PAGE_FETCH_FP, scaling_fail_point};
use crate::scaling_error;
use crate::types::{
    DataNode, DataRecord, FinishedRecord, InventoryPosition, Operation, Position, Record,
};

/// How an inventory dump ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventoryDumpResult {
    /// Every row and the finished marker were pushed.
    Completed { rows: u64 },
    /// The stop signal arrived first.
    Stopped { rows: u64 },
}

/// Where a scan continues.
#[derive(Debug, Clone)]
enum Cursor {
    Key { from: Option<i64>, to: Option<i64> },
    Offset { offset: u64, kind: UniqueKeyKind },
    /// The largest representable key was copied.
    Exhausted,
}

/// Copies every row of one table into a channel as INSERT records, followed by a
/// [`FinishedRecord`].
///
/// Tables with an integer unique key are paged by key, and every record carries the range that
/// is still left to copy after it. Resuming from such a position skips the rows already applied.
/// String keyed tables cannot resume mid-table and are rescanned from the start. Tables without a
/// unique key are refused, since a rescan would insert their rows a second time.
#[derive(Debug)]
pub struct InventoryDumper<S> {
    data_node: DataNode,
    table_name: String,
    start: InventoryPosition,
    batch_size: usize,
    source: S,
    channel: Arc<dyn PipelineChannel>,
    shutdown_rx: ShutdownRx,
}

impl<S> InventoryDumper<S>
where
    S: InventorySource + Send + Sync,
{
    pub fn new(
        data_node: DataNode,
        table_name: impl Into<String>,
        start: InventoryPosition,
        batch_size: usize,
        source: S,
        channel: Arc<dyn PipelineChannel>,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            data_node,
            table_name: table_name.into(),
            start,
            batch_size: batch_size.max(1),
            source,
            channel,
            shutdown_rx,
        }
    }

    pub fn data_node(&self) -> &DataNode {
        &self.data_node
    }

    pub async fn run(self) -> ScalingResult<InventoryDumpResult> {
        let mut cursor = self.initial_cursor().await?;
        info!(table = %self.data_node, start = %self.start, "inventory dump started");

        let mut rows = 0u64;
        let mut last_position = Position::Inventory(self.start.clone());

        loop {
            if self.shutdown_rx.is_shutdown() {
                return Ok(self.stopped(rows));
            }

            #[cfg(feature = "failpoints")]
            scaling_fail_point(INVENTORY_PAGE_FETCH_FP)?;

            let request = match &cursor {
                Cursor::Key { from, to } => PageRequest::KeyRange {
                    from: *from,
                    to: *to,
                },
                Cursor::Offset { offset, .. } => PageRequest::Offset(*offset),
                Cursor::Exhausted => break,
            };

            let mut shutdown_rx = self.shutdown_rx.clone();
            let page = tokio::select! {
                biased;

                _ = shutdown_rx.wait() => return Ok(self.stopped(rows)),
                page = self.source.read_page(&self.data_node, &request, self.batch_size) => page?,
            };

            let page_len = page.len();
            if page_len == 0 {
                break;
            }

            let mut records = Vec::with_capacity(page_len);
            for row in page {
                let position = self.advance(&mut cursor, &row)?;
                last_position = Position::Inventory(position.clone());
                records.push(Record::Data(DataRecord {
                    data_node: self.data_node.clone(),
                    table_name: self.table_name.clone(),
                    operation: Operation::Insert,
                    columns: row.columns,
                    position: Position::Inventory(position),
                }));
            }

            if let ShutdownResult::Shutdown(_) = self.channel.push_records(records).await {
                return Ok(self.stopped(rows));
            }

            rows += page_len as u64;
            debug!(table = %self.data_node, rows, position = %last_position, "inventory page pushed");

            if page_len < self.batch_size || matches!(cursor, Cursor::Exhausted) {
                break;
            }
        }

        let finished = Record::Finished(FinishedRecord {
            data_node: self.data_node.clone(),
            position: last_position,
        });
        if let ShutdownResult::Shutdown(_) = self.channel.push_records(vec![finished]).await {
            return Ok(self.stopped(rows));
        }

        info!(table = %self.data_node, rows, "inventory dump completed");

        Ok(InventoryDumpResult::Completed { rows })
    }

    async fn initial_cursor(&self) -> ScalingResult<Cursor> {
        if let InventoryPosition::IntegerPrimaryKey { begin, end } = &self.start {
            return Ok(Cursor::Key {
                from: Some(*begin),
                to: *end,
            });
        }

        if !matches!(self.start, InventoryPosition::Placeholder) {
            warn!(
                table = %self.data_node,
                position = %self.start,
                "position cannot be resumed, rescanning the whole table"
            );
        }

        let cursor = match self.source.unique_key_kind(&self.data_node).await? {
            UniqueKeyKind::Integer => Cursor::Key {
                from: None,
                to: None,
            },
            UniqueKeyKind::String => Cursor::Offset {
                offset: 0,
                kind: UniqueKeyKind::String,
            },
            UniqueKeyKind::None => {
                return Err(scaling_error!(
                    ErrorKind::InvalidData,
                    "Table has no unique key, its rows cannot be copied idempotently",
                    self.data_node.to_string()
                ));
            }
        };

        Ok(cursor)
    }

    /// Moves the cursor past `row` and returns the position the scan resumes from after it.
    fn advance(&self, cursor: &mut Cursor, row: &SourceRow) -> ScalingResult<InventoryPosition> {
        match cursor {
            Cursor::Key { from, to } => {
                let key = row.integer_key().ok_or_else(|| {
                    scaling_error!(
                        ErrorKind::InvalidData,
                        "Row read by key range has no integer unique key",
                        self.data_node.to_string()
                    )
                })?;
                let end = *to;
                let Some(next) = key.checked_add(1) else {
                    // Nothing sorts after this key. A resume reads this last row again.
                    *cursor = Cursor::Exhausted;
                    return Ok(InventoryPosition::IntegerPrimaryKey {
                        begin: key,
                        end: Some(key),
                    });
                };
                *from = Some(next);

                Ok(InventoryPosition::IntegerPrimaryKey { begin: next, end })
            }
            Cursor::Offset { offset, kind } => {
                *offset += 1;

                Ok(match (kind, row.key_text()) {
                    (UniqueKeyKind::String, Some(key)) => InventoryPosition::StringPrimaryKey {
                        begin: key,
                        end: String::new(),
                    },
                    _ => InventoryPosition::Unsupported,
                })
            }
            Cursor::Exhausted => Err(scaling_error!(
                ErrorKind::InvalidData,
                "Row read past the largest unique key",
                self.data_node.to_string()
            )),
        }
    }

    fn stopped(&self, rows: u64) -> InventoryDumpResult {
        info!(table = %self.data_node, rows, "inventory dump stopped");
        InventoryDumpResult::Stopped { rows }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;
    use crate::channel::MemoryPipelineChannel;
    use crate::concurrency::shutdown::create_shutdown_channel;
    use crate::types::{Cell, Column};

    /// Table keyed by an integer id, served in key order.
    #[derive(Debug, Clone)]
    struct KeyedTable(BTreeMap<i64, String>);

    impl InventorySource for KeyedTable {
        async fn unique_key_kind(&self, _data_node: &DataNode) -> ScalingResult<UniqueKeyKind> {
            Ok(UniqueKeyKind::Integer)
        }

        async fn read_page(
            &self,
            _data_node: &DataNode,
            request: &PageRequest,
            limit: usize,
        ) -> ScalingResult<Vec<SourceRow>> {
            let PageRequest::KeyRange { from, to } = request else {
                panic!("keyed tables are paged by key");
            };

            Ok(self
                .0
                .range(from.unwrap_or(i64::MIN)..=to.unwrap_or(i64::MAX))
                .take(limit)
                .map(|(id, name)| {
                    SourceRow::new(vec![
                        Column::new("id", *id, true),
                        Column::new("name", name.as_str(), false),
                    ])
                })
                .collect())
        }
    }

    fn table(ids: impl IntoIterator<Item = i64>) -> KeyedTable {
        KeyedTable(ids.into_iter().map(|id| (id, format!("row-{id}"))).collect())
    }

    async fn drain(channel: &MemoryPipelineChannel) -> Vec<Record> {
        let mut records = Vec::new();
        loop {
            let batch = channel.fetch_records(100, Duration::from_millis(10)).await;
            if batch.is_empty() {
                return records;
            }
            records.extend(batch);
        }
    }

    fn ids(records: &[Record]) -> Vec<i64> {
        records
            .iter()
            .filter_map(|record| match record {
                Record::Data(data) => data.integer_unique_key(),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn dumps_pages_then_the_finished_marker() {
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let channel = Arc::new(MemoryPipelineChannel::new(100, None, shutdown_rx.clone()));
        let dumper = InventoryDumper::new(
            DataNode::new("ds0", "t_order_0"),
            "t_order",
            InventoryPosition::Placeholder,
            2,
            table(1..=5),
            channel.clone(),
            shutdown_rx,
        );

        assert_eq!(
            dumper.run().await.unwrap(),
            InventoryDumpResult::Completed { rows: 5 }
        );

        let records = drain(&channel).await;
        assert_eq!(ids(&records), vec![1, 2, 3, 4, 5]);
        assert!(records.last().unwrap().is_finished());
        assert!(records[..5].iter().all(|record| matches!(
            record,
            Record::Data(DataRecord { operation: Operation::Insert, table_name, .. })
                if table_name == "t_order"
        )));
        assert_eq!(
            records[4].position(),
            &Position::Inventory(InventoryPosition::IntegerPrimaryKey {
                begin: 6,
                end: None
            })
        );
    }

    #[tokio::test]
    async fn resumes_from_the_recorded_position() {
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let channel = Arc::new(MemoryPipelineChannel::new(100, None, shutdown_rx.clone()));
        let dumper = InventoryDumper::new(
            DataNode::new("ds0", "t_order_0"),
            "t_order",
            InventoryPosition::IntegerPrimaryKey {
                begin: 4,
                end: Some(8),
            },
            10,
            table(1..=10),
            channel.clone(),
            shutdown_rx,
        );

        dumper.run().await.unwrap();

        assert_eq!(ids(&drain(&channel).await), vec![4, 5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn stops_while_blocked_on_a_full_channel() {
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let channel = Arc::new(MemoryPipelineChannel::new(1, None, shutdown_rx.clone()));
        let dumper = InventoryDumper::new(
            DataNode::new("ds0", "t_order_0"),
            "t_order",
            InventoryPosition::Placeholder,
            4,
            table(1..=100),
            channel,
            shutdown_rx,
        );

        let handle = tokio::spawn(dumper.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.shutdown();

        assert_eq!(
            handle.await.unwrap().unwrap(),
            InventoryDumpResult::Stopped { rows: 0 }
        );
    }

    #[tokio::test]
    async fn largest_key_ends_the_scan() {
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let channel = Arc::new(MemoryPipelineChannel::new(100, None, shutdown_rx.clone()));
        let dumper = InventoryDumper::new(
            DataNode::new("ds0", "t_order_0"),
            "t_order",
            InventoryPosition::Placeholder,
            2,
            table([1, i64::MAX]),
            channel.clone(),
            shutdown_rx.clone(),
        );

        assert_eq!(
            dumper.run().await.unwrap(),
            InventoryDumpResult::Completed { rows: 2 }
        );

        let records = drain(&channel).await;
        assert_eq!(ids(&records), vec![1, i64::MAX]);
        assert!(records.last().unwrap().is_finished());
        let last_key_position = Position::Inventory(InventoryPosition::IntegerPrimaryKey {
            begin: i64::MAX,
            end: Some(i64::MAX),
        });
        assert_eq!(records[1].position(), &last_key_position);
        assert_eq!(records[2].position(), &last_key_position);

        // Resuming from there copies the last row once more and finishes.
        let resumed = InventoryDumper::new(
            DataNode::new("ds0", "t_order_0"),
            "t_order",
            InventoryPosition::IntegerPrimaryKey {
                begin: i64::MAX,
                end: Some(i64::MAX),
            },
            2,
            table([1, i64::MAX]),
            channel.clone(),
            shutdown_rx,
        );

        assert_eq!(
            resumed.run().await.unwrap(),
            InventoryDumpResult::Completed { rows: 1 }
        );
        assert_eq!(ids(&drain(&channel).await), vec![i64::MAX]);
    }

    #[test]
    fn string_keys_are_recorded_but_not_resumable() {
        let row = SourceRow::new(vec![Column::new("code", Cell::from("abc"), true)]);
        assert_eq!(row.integer_key(), None);
        assert_eq!(row.key_text().as_deref(), Some("abc"));
    }
}
