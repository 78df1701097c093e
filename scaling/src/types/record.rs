use std::fmt;

use crate::types::{Cell, DataNode, Position};

/// Kind of change carried by a [`DataRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Insert => f.write_str("INSERT"),
            Operation::Update => f.write_str("UPDATE"),
            Operation::Delete => f.write_str("DELETE"),
        }
    }
}

/// A column of a changed row.
///
/// `old_value` holds the before image when the source provides one. `updated` tells whether an
/// UPDATE touched the column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub old_value: Option<Cell>,
    pub value: Cell,
    pub updated: bool,
    pub unique_key: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, value: impl Into<Cell>, unique_key: bool) -> Self {
        Self {
            name: name.into(),
            old_value: None,
            value: value.into(),
            updated: true,
            unique_key,
        }
    }

    /// Sets the before image of the column.
    pub fn with_old_value(mut self, old_value: impl Into<Cell>) -> Self {
        self.old_value = Some(old_value.into());
        self
    }

    /// Returns the value that identified the row before the change.
    pub fn key_value(&self) -> &Cell {
        self.old_value.as_ref().unwrap_or(&self.value)
    }
}

/// A changed row.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRecord {
    /// Source table the row was read from.
    pub data_node: DataNode,
    /// Logical table the row is written to on the target.
    pub table_name: String,
    pub operation: Operation,
    pub columns: Vec<Column>,
    pub position: Position,
}

impl DataRecord {
    pub fn unique_key_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|column| column.unique_key)
    }

    /// Returns the integer unique key of the row, when it has exactly one.
    pub fn integer_unique_key(&self) -> Option<i64> {
        let mut keys = self.unique_key_columns();
        let key = keys.next()?;
        if keys.next().is_some() {
            return None;
        }

        key.value.as_i64()
    }
}

/// Marks that the inventory of a table was completely dumped.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedRecord {
    pub data_node: DataNode,
    pub position: Position,
}

/// Advances the position without carrying data, for example on a source heartbeat.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceholderRecord {
    pub position: Position,
}

/// Unit of data moving from a dumper to an importer.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Data(DataRecord),
    Finished(FinishedRecord),
    Placeholder(PlaceholderRecord),
}

impl Record {
    pub fn position(&self) -> &Position {
        match self {
            Record::Data(record) => &record.position,
            Record::Finished(record) => &record.position,
            Record::Placeholder(record) => &record.position,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Record::Finished(_))
    }
}
