//! In-memory collaborators for exercising pipelines in tests.
//!
//! The sources and the target behave like real databases where the pipeline can observe it:
//! positions are ordered, streams break on disconnect, and writes are transactional.

#[cfg(feature = "failpoints")]
pub mod failpoints;
pub mod notify;
pub mod source;
pub mod target;

use crate::types::{Column, DataNode};

/// Shorthand for a `t_order` shard row keyed by `order_id`.
pub fn order_row(order_id: i64, status: &str) -> Vec<Column> {
    vec![
        Column::new("order_id", order_id, true),
        Column::new("status", status, false),
    ]
}

/// The data node of shard `shard` of `t_order` on `ds_0`.
pub fn order_node(shard: u32) -> DataNode {
    DataNode::new("ds_0", format!("t_order_{shard}"))
}
