//! Common types shared by the dumpers, the channel, and the importer.

mod cell;
mod data_node;
mod database_type;
mod position;
mod record;

pub use cell::*;
pub use data_node::*;
pub use database_type::*;
pub use position::*;
pub use record::*;
