//! Read side of a migration job.
//!
//! The inventory dumper copies existing rows table by table. The incremental dumper follows the
//! source change stream. Both push [`crate::types::Record`]s into a channel and leave applying
//! and acknowledging them to the importer.

mod incremental;
mod inventory;
pub mod reconnect;
pub mod source;

pub use incremental::{IncrementalDumper, IncrementalDumperConfig};
pub use inventory::{InventoryDumpResult, InventoryDumper};
pub use reconnect::{ConnectionStatus, ReconnectionManager};
pub use source::{
    ChangeEvent, ChangeStreamSource, InventorySource, PageRequest, SourceRow, UniqueKeyKind,
};
