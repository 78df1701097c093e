//! YAML form of [`JobProgress`].
//!
//! ```yaml
//! status: RUNNING
//! sourceDatabaseType: H2
//! inventory:
//!   finished:
//!   - ds0.t_2
//!   unfinished:
//!     ds1.t_2: i,1,2
//!     ds1.t_1: ''
//! incremental:
//!   dataSourceName: ds0
//!   position: ''
//! ```
//!
//! `incremental` and `errorMessage` are omitted when absent. A document without `inventory`
//! reads as empty inventory progress.

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::error::{ErrorKind, ScalingResult};
use crate::progress::model::{IncrementalProgress, InventoryProgress, JobProgress};
use crate::scaling_error;
use crate::types::{DataNode, DatabaseType, InventoryPosition, StreamPosition};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct YamlJobProgress {
    status: String,
    source_database_type: String,
    #[serde(default)]
    inventory: Option<YamlInventoryProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    incremental: Option<YamlIncrementalProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct YamlInventoryProgress {
    #[serde(default)]
    finished: Option<Vec<String>>,
    /// Kept as a mapping so the document order survives a round trip.
    #[serde(default)]
    unfinished: Option<Mapping>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct YamlIncrementalProgress {
    data_source_name: String,
    #[serde(default)]
    position: Option<String>,
}

/// Encodes `progress` as a YAML document.
pub fn to_yaml(progress: &JobProgress) -> ScalingResult<String> {
    let inventory = &progress.inventory;

    let mut unfinished = Mapping::new();
    for (data_node, position) in inventory.unfinished() {
        unfinished.insert(
            Value::String(data_node.to_string()),
            Value::String(position.to_string()),
        );
    }

    let document = YamlJobProgress {
        status: progress.status.to_string(),
        source_database_type: progress.source_database_type.to_string(),
        inventory: Some(YamlInventoryProgress {
            finished: Some(inventory.finished().iter().map(ToString::to_string).collect()),
            unfinished: Some(unfinished),
        }),
        incremental: progress
            .incremental
            .as_ref()
            .map(|incremental| YamlIncrementalProgress {
                data_source_name: incremental.data_source_name.clone(),
                position: Some(incremental.position.to_string()),
            }),
        error_message: progress.error_message.clone(),
    };

    Ok(serde_yaml::to_string(&document)?)
}

/// Decodes a YAML document written by [`to_yaml`].
///
/// Any malformed field is an [`ErrorKind::InvalidCheckpoint`] error.
pub fn from_yaml(document: &str) -> ScalingResult<JobProgress> {
    let document: YamlJobProgress = serde_yaml::from_str(document)?;

    let source_database_type = document
        .source_database_type
        .parse::<DatabaseType>()
        .map_err(|err| {
            scaling_error!(
                ErrorKind::InvalidCheckpoint,
                "Checkpoint names an unsupported database type",
                document.source_database_type.clone(),
                source: err
            )
        })?;

    let inventory = document.inventory.unwrap_or_default();
    let finished = inventory
        .finished
        .unwrap_or_default()
        .iter()
        .map(|node| node.parse::<DataNode>())
        .collect::<ScalingResult<Vec<_>>>()?;

    let mut unfinished = Vec::new();
    for (key, value) in inventory.unfinished.unwrap_or_default() {
        let data_node = yaml_string(key)?.parse::<DataNode>()?;
        let position = yaml_string(value)?.parse::<InventoryPosition>()?;
        unfinished.push((data_node, position));
    }

    Ok(JobProgress {
        status: document.status.parse()?,
        source_database_type,
        inventory: InventoryProgress::from_parts(finished, unfinished),
        incremental: document
            .incremental
            .map(|incremental| IncrementalProgress {
                data_source_name: incremental.data_source_name,
                position: StreamPosition::new(incremental.position.unwrap_or_default()),
            }),
        error_message: document.error_message,
    })
}

/// Reads a scalar as a string. A null value reads as the empty string.
fn yaml_string(value: Value) -> ScalingResult<String> {
    match value {
        Value::String(value) => Ok(value),
        Value::Null => Ok(String::new()),
        Value::Number(value) => Ok(value.to_string()),
        other => Err(scaling_error!(
            ErrorKind::InvalidCheckpoint,
            "Checkpoint entry is not a string",
            format!("{other:?}")
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::model::JobStatus;

    const FULL_PROGRESS: &str = "\
status: RUNNING
sourceDatabaseType: H2
inventory:
  finished:
  - ds0.t_2
  - ds0.t_1
  unfinished:
    ds1.t_2: i,1,2
    ds1.t_1: ''
incremental:
  dataSourceName: ds0
  position: ''
";

    const NO_INCREMENTAL: &str = "\
status: RUNNING
sourceDatabaseType: H2
inventory:
  finished:
  - ds0.t_1
  unfinished:
    ds1.t_2: i,1,2
";

    const NO_INVENTORY: &str = "\
status: RUNNING
sourceDatabaseType: H2
incremental:
  dataSourceName: ds0
  position: binlog.000002:1024
";

    #[test]
    fn full_progress_round_trips() {
        let progress = from_yaml(FULL_PROGRESS).unwrap();

        assert_eq!(progress.status, JobStatus::Running);
        assert_eq!(progress.source_database_type, DatabaseType::H2);
        assert_eq!(
            progress.inventory.finished(),
            &[DataNode::new("ds0", "t_2"), DataNode::new("ds0", "t_1")]
        );
        assert_eq!(
            progress.inventory.unfinished(),
            &[
                (
                    DataNode::new("ds1", "t_2"),
                    InventoryPosition::IntegerPrimaryKey {
                        begin: 1,
                        end: Some(2)
                    }
                ),
                (DataNode::new("ds1", "t_1"), InventoryPosition::Placeholder),
            ]
        );
        let incremental = progress.incremental.as_ref().unwrap();
        assert_eq!(incremental.data_source_name, "ds0");
        assert!(incremental.position.is_empty());

        let encoded = to_yaml(&progress).unwrap();
        let expected: Value = serde_yaml::from_str(FULL_PROGRESS).unwrap();
        let actual: Value = serde_yaml::from_str(&encoded).unwrap();
        assert_eq!(actual, expected);
        assert!(encoded.find("ds0.t_2").unwrap() < encoded.find("ds0.t_1").unwrap());
        assert!(encoded.find("ds1.t_2").unwrap() < encoded.find("ds1.t_1").unwrap());
        assert_eq!(from_yaml(&encoded).unwrap(), progress);
    }

    #[test]
    fn absent_incremental_stays_absent() {
        let progress = from_yaml(NO_INCREMENTAL).unwrap();
        assert!(progress.incremental.is_none());

        let encoded = to_yaml(&progress).unwrap();
        assert!(!encoded.contains("incremental"));
        assert!(from_yaml(&encoded).unwrap().incremental.is_none());
    }

    #[test]
    fn absent_inventory_reads_as_empty() {
        let progress = from_yaml(NO_INVENTORY).unwrap();

        assert!(progress.inventory.finished().is_empty());
        assert!(progress.inventory.unfinished().is_empty());

        let encoded = to_yaml(&progress).unwrap();
        assert!(encoded.contains("unfinished: {}"));
        assert!(encoded.contains("finished: []"));
    }

    #[test]
    fn error_message_is_written_only_when_present() {
        let mut progress = JobProgress::new(DatabaseType::MySql);
        assert!(!to_yaml(&progress).unwrap().contains("errorMessage"));

        progress.status = JobStatus::Failed;
        progress.error_message = Some("import retries exhausted".to_string());
        let decoded = from_yaml(&to_yaml(&progress).unwrap()).unwrap();

        assert_eq!(decoded, progress);
    }

    #[test]
    fn malformed_documents_are_invalid_checkpoints() {
        let cases = [
            "status: [",
            "status: RUNNING\nsourceDatabaseType: Oracle\n",
            "status: SLEEPING\nsourceDatabaseType: H2\n",
            "status: RUNNING\nsourceDatabaseType: H2\ninventory:\n  finished:\n  - t_1\n",
            "status: RUNNING\nsourceDatabaseType: H2\ninventory:\n  unfinished:\n    ds0.t_1: x,1,2\n",
        ];

        for case in cases {
            let err = from_yaml(case).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidCheckpoint, "{case}");
        }
    }
}
