//! Write side of a migration job.
//!
//! The importer is shared by every target. Only schema resolution and identifier quoting differ
//! per database, and they are injected through an [`ImporterDialect`].

mod apply;
pub mod dialect;
pub mod sql;
pub mod target;

pub use apply::{ImportResult, Importer, ImporterConfig};
pub use dialect::{
    DEFAULT_SCHEMA, ImporterDialect, MySqlDialect, OpenGaussDialect, PostgreSqlDialect,
    dialect_for,
};
pub use sql::{SqlBuilder, SqlStatement};
pub use target::ImportTarget;
