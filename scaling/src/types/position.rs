use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::bail;
use crate::error::{ErrorKind, ScalingError};

/// How far the inventory scan of one table progressed.
///
/// Serialized forms:
/// - `""`: start of the table, nothing applied yet.
/// - `"i,<begin>,<end>"`: integer unique key range still to copy. `begin` is inclusive, `end` is
///   inclusive and may be empty for an open range.
/// - `"s,<begin>,<end>"`: string unique key range.
/// - `"u,,"`: the table has no usable unique key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InventoryPosition {
    Placeholder,
    IntegerPrimaryKey { begin: i64, end: Option<i64> },
    StringPrimaryKey { begin: String, end: String },
    Unsupported,
}

impl InventoryPosition {
    /// Returns `true` when resuming from this position means rescanning the whole table.
    pub fn requires_full_scan(&self) -> bool {
        !matches!(self, InventoryPosition::IntegerPrimaryKey { .. })
    }
}

impl PartialOrd for InventoryPosition {
    /// Orders positions by scan progress.
    ///
    /// The placeholder precedes everything. Integer and string ranges are ordered by their
    /// bounds within their own kind and are not comparable across kinds.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        use InventoryPosition::*;

        match (self, other) {
            (Placeholder, Placeholder) | (Unsupported, Unsupported) => Some(Ordering::Equal),
            (Placeholder, _) => Some(Ordering::Less),
            (_, Placeholder) => Some(Ordering::Greater),
            (
                IntegerPrimaryKey { begin, end },
                IntegerPrimaryKey {
                    begin: other_begin,
                    end: other_end,
                },
            ) => Some((begin, end).cmp(&(other_begin, other_end))),
            (
                StringPrimaryKey { begin, end },
                StringPrimaryKey {
                    begin: other_begin,
                    end: other_end,
                },
            ) => Some((begin, end).cmp(&(other_begin, other_end))),
            _ => None,
        }
    }
}

impl fmt::Display for InventoryPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InventoryPosition::Placeholder => Ok(()),
            InventoryPosition::IntegerPrimaryKey { begin, end } => match end {
                Some(end) => write!(f, "i,{begin},{end}"),
                None => write!(f, "i,{begin},"),
            },
            InventoryPosition::StringPrimaryKey { begin, end } => write!(f, "s,{begin},{end}"),
            InventoryPosition::Unsupported => f.write_str("u,,"),
        }
    }
}

impl FromStr for InventoryPosition {
    type Err = ScalingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(InventoryPosition::Placeholder);
        }

        let mut parts = s.splitn(3, ',');
        let (Some(kind), Some(begin), Some(end)) = (parts.next(), parts.next(), parts.next())
        else {
            bail!(
                ErrorKind::InvalidCheckpoint,
                "Inventory position is malformed",
                format!("expected `<kind>,<begin>,<end>`, got `{s}`")
            );
        };

        match kind {
            "i" => {
                let Ok(begin) = begin.parse::<i64>() else {
                    bail!(
                        ErrorKind::InvalidCheckpoint,
                        "Inventory position has a non integer bound",
                        s.to_string()
                    );
                };
                let end = match end {
                    "" => None,
                    end => match end.parse::<i64>() {
                        Ok(end) => Some(end),
                        Err(_) => bail!(
                            ErrorKind::InvalidCheckpoint,
                            "Inventory position has a non integer bound",
                            s.to_string()
                        ),
                    },
                };

                Ok(InventoryPosition::IntegerPrimaryKey { begin, end })
            }
            "s" => Ok(InventoryPosition::StringPrimaryKey {
                begin: begin.to_string(),
                end: end.to_string(),
            }),
            "u" => Ok(InventoryPosition::Unsupported),
            _ => bail!(
                ErrorKind::InvalidCheckpoint,
                "Inventory position has an unknown kind",
                s.to_string()
            ),
        }
    }
}

/// An opaque position in a source change stream, such as a binlog coordinate or an LSN.
///
/// Only the source that produced it knows its structure. An empty value means no position has
/// been recorded yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct StreamPosition(String);

impl StreamPosition {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The position a record was read at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Position {
    Inventory(InventoryPosition),
    Stream(StreamPosition),
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Inventory(position) => position.fmt(f),
            Position::Stream(position) => position.fmt(f),
        }
    }
}
