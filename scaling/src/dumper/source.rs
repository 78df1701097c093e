use std::future::Future;

use futures::Stream;

use crate::error::ScalingResult;
use crate::types::{Cell, Column, DataNode, Operation, StreamPosition};

/// Kind of unique key a source table can be paged by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueKeyKind {
    Integer,
    String,
    None,
}

/// Which rows of a table a page read covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageRequest {
    /// Rows whose integer unique key lies in `from..=to`, where an absent bound is open.
    KeyRange { from: Option<i64>, to: Option<i64> },
    /// Rows after skipping `offset` rows in a stable table order.
    Offset(u64),
}

/// A row read by the inventory scan.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    pub columns: Vec<Column>,
}

impl SourceRow {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    /// Returns the integer unique key, when the row has exactly one unique key column holding
    /// an integer.
    pub fn integer_key(&self) -> Option<i64> {
        let mut keys = self.columns.iter().filter(|column| column.unique_key);
        let key = keys.next()?;
        if keys.next().is_some() {
            return None;
        }

        key.value.as_i64()
    }

    /// Returns the first unique key value rendered as text. Strings are returned unquoted.
    pub fn key_text(&self) -> Option<String> {
        let key = self.columns.iter().find(|column| column.unique_key)?;

        match &key.value {
            Cell::String(value) => Some(value.clone()),
            value => Some(value.to_string()),
        }
    }
}

/// Read side of the inventory dump.
pub trait InventorySource {
    fn unique_key_kind(
        &self,
        data_node: &DataNode,
    ) -> impl Future<Output = ScalingResult<UniqueKeyKind>> + Send;

    /// Reads at most `limit` rows. Key range pages are ordered by ascending key.
    fn read_page(
        &self,
        data_node: &DataNode,
        request: &PageRequest,
        limit: usize,
    ) -> impl Future<Output = ScalingResult<Vec<SourceRow>>> + Send;
}

/// A change read from the source change stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Row {
        data_node: DataNode,
        operation: Operation,
        columns: Vec<Column>,
        position: StreamPosition,
    },
    /// Source is alive, nothing changed up to `position`.
    Heartbeat { position: StreamPosition },
}

impl ChangeEvent {
    pub fn position(&self) -> &StreamPosition {
        match self {
            ChangeEvent::Row { position, .. } => position,
            ChangeEvent::Heartbeat { position } => position,
        }
    }
}

/// Read side of the incremental dump.
///
/// Losing the connection shows up as an error of a connection-loss kind, or as the stream
/// ending. Errors of any other kind are not recoverable.
pub trait ChangeStreamSource {
    type Stream: Stream<Item = ScalingResult<ChangeEvent>> + Send + Unpin;

    /// Opens the stream at the events following `after`, or at the current end of the change
    /// log when `after` is `None`.
    fn open(
        &self,
        after: Option<StreamPosition>,
    ) -> impl Future<Output = ScalingResult<Self::Stream>> + Send;
}
