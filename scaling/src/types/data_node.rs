use std::fmt;
use std::str::FromStr;

use crate::bail;
use crate::error::{ErrorKind, ScalingError};

/// An actual table on one source data source, written `"<dataSource>.<table>"`.
///
/// This is the key under which inventory progress is checkpointed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataNode {
    pub data_source_name: String,
    pub table_name: String,
}

impl DataNode {
    pub fn new(data_source_name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            data_source_name: data_source_name.into(),
            table_name: table_name.into(),
        }
    }
}

impl fmt::Display for DataNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.data_source_name, self.table_name)
    }
}

impl FromStr for DataNode {
    type Err = ScalingError;

    /// Splits on the first dot, so table names may themselves contain dots.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((data_source, table)) if !data_source.is_empty() && !table.is_empty() => {
                Ok(DataNode::new(data_source, table))
            }
            _ => bail!(
                ErrorKind::InvalidCheckpoint,
                "Data node is malformed",
                format!("expected `<dataSource>.<table>`, got `{s}`")
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_formats_data_nodes() {
        let node: DataNode = "ds_0.t_order_1".parse().unwrap();

        assert_eq!(node, DataNode::new("ds_0", "t_order_1"));
        assert_eq!(node.to_string(), "ds_0.t_order_1");
    }

    #[test]
    fn rejects_nodes_without_both_parts() {
        for raw in ["t_order", ".t_order", "ds_0.", ""] {
            let err = raw.parse::<DataNode>().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidCheckpoint);
        }
    }
}
