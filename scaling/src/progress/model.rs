use std::fmt;
use std::str::FromStr;

use crate::bail;
use crate::error::{ErrorKind, ScalingError};
use crate::types::{DataNode, DatabaseType, InventoryPosition, StreamPosition};

/// Lifecycle state of a scaling job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Preparing,
    Running,
    ExecuteInventoryTask,
    ExecuteIncrementalTask,
    Finished,
    Stopped,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Preparing => "PREPARING",
            JobStatus::Running => "RUNNING",
            JobStatus::ExecuteInventoryTask => "EXECUTE_INVENTORY_TASK",
            JobStatus::ExecuteIncrementalTask => "EXECUTE_INCREMENTAL_TASK",
            JobStatus::Finished => "FINISHED",
            JobStatus::Stopped => "STOPPED",
            JobStatus::Failed => "FAILED",
        }
    }

    /// Returns `true` for states a job never leaves without being restarted.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Stopped | JobStatus::Failed
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ScalingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "PREPARING" => JobStatus::Preparing,
            "RUNNING" => JobStatus::Running,
            "EXECUTE_INVENTORY_TASK" => JobStatus::ExecuteInventoryTask,
            "EXECUTE_INCREMENTAL_TASK" => JobStatus::ExecuteIncrementalTask,
            "FINISHED" => JobStatus::Finished,
            "STOPPED" => JobStatus::Stopped,
            "FAILED" => JobStatus::Failed,
            other => bail!(
                ErrorKind::InvalidCheckpoint,
                "Unknown job status",
                other.to_string()
            ),
        };

        Ok(status)
    }
}

/// Inventory progress of every table of a job.
///
/// A table is either in `finished` or in `unfinished`, never in both. Both collections keep the
/// order in which tables were recorded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InventoryProgress {
    finished: Vec<DataNode>,
    unfinished: Vec<(DataNode, InventoryPosition)>,
}

impl InventoryProgress {
    /// Builds progress from already ordered parts, as read from a checkpoint.
    pub fn from_parts(
        finished: Vec<DataNode>,
        unfinished: Vec<(DataNode, InventoryPosition)>,
    ) -> Self {
        Self {
            finished,
            unfinished,
        }
    }

    pub fn finished(&self) -> &[DataNode] {
        &self.finished
    }

    pub fn unfinished(&self) -> &[(DataNode, InventoryPosition)] {
        &self.unfinished
    }

    pub fn is_finished(&self, data_node: &DataNode) -> bool {
        self.finished.contains(data_node)
    }

    pub fn unfinished_position(&self, data_node: &DataNode) -> Option<&InventoryPosition> {
        self.unfinished
            .iter()
            .find(|(node, _)| node == data_node)
            .map(|(_, position)| position)
    }

    /// Returns `true` once at least one table was recorded and none is left unfinished.
    pub fn is_complete(&self) -> bool {
        !self.finished.is_empty() && self.unfinished.is_empty()
    }

    /// Records `position` for an unfinished table, adding the table when it is new.
    pub(crate) fn set_unfinished(&mut self, data_node: DataNode, position: InventoryPosition) {
        match self.unfinished.iter_mut().find(|(node, _)| *node == data_node) {
            Some((_, current)) => *current = position,
            None => self.unfinished.push((data_node, position)),
        }
    }

    /// Moves a table to `finished`.
    pub(crate) fn mark_finished(&mut self, data_node: DataNode) {
        self.unfinished.retain(|(node, _)| *node != data_node);
        if !self.finished.contains(&data_node) {
            self.finished.push(data_node);
        }
    }
}

/// Position of the change stream of one data source.
#[derive(Debug, Clone, PartialEq)]
pub struct IncrementalProgress {
    pub data_source_name: String,
    /// Empty until the first change was applied.
    pub position: StreamPosition,
}

/// The checkpoint of a scaling job.
///
/// `incremental` is `None` until incremental dumping started, which is distinct from an
/// incremental progress whose position is still empty.
#[derive(Debug, Clone, PartialEq)]
pub struct JobProgress {
    pub status: JobStatus,
    pub source_database_type: DatabaseType,
    pub inventory: InventoryProgress,
    pub incremental: Option<IncrementalProgress>,
    pub error_message: Option<String>,
}

impl JobProgress {
    /// Creates the empty progress of a job that has not dumped anything yet.
    pub fn new(source_database_type: DatabaseType) -> Self {
        Self {
            status: JobStatus::Preparing,
            source_database_type,
            inventory: InventoryProgress::default(),
            incremental: None,
            error_message: None,
        }
    }
}
