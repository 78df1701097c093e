use std::fmt;
use std::sync::Arc;

use crate::types::DatabaseType;

/// Schema used by schema-aware targets when none is configured.
pub const DEFAULT_SCHEMA: &str = "public";

/// The part of applying records that depends on the target database product.
pub trait ImporterDialect: fmt::Debug + Send + Sync {
    fn database_type(&self) -> DatabaseType;

    /// Returns the schema that qualifies `logical_table`, or `None` when the target has no
    /// schema concept.
    fn schema_name(&self, logical_table: &str) -> Option<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

impl ImporterDialect for MySqlDialect {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::MySql
    }

    fn schema_name(&self, _logical_table: &str) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct PostgreSqlDialect {
    schema: String,
}

impl PostgreSqlDialect {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
        }
    }
}

impl Default for PostgreSqlDialect {
    fn default() -> Self {
        Self::new(DEFAULT_SCHEMA)
    }
}

impl ImporterDialect for PostgreSqlDialect {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSql
    }

    fn schema_name(&self, _logical_table: &str) -> Option<String> {
        Some(self.schema.clone())
    }
}

/// openGauss resolves schemas the same way PostgreSQL does.
#[derive(Debug, Clone)]
pub struct OpenGaussDialect {
    schema: String,
}

impl OpenGaussDialect {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
        }
    }
}

impl Default for OpenGaussDialect {
    fn default() -> Self {
        Self::new(DEFAULT_SCHEMA)
    }
}

impl ImporterDialect for OpenGaussDialect {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::OpenGauss
    }

    fn schema_name(&self, _logical_table: &str) -> Option<String> {
        Some(self.schema.clone())
    }
}

/// Returns the default dialect of `database_type`.
///
/// H2 only appears as a source in tests and is written like MySQL, without schemas.
pub fn dialect_for(database_type: DatabaseType) -> Arc<dyn ImporterDialect> {
    match database_type {
        DatabaseType::MySql | DatabaseType::H2 => Arc::new(MySqlDialect),
        DatabaseType::PostgreSql => Arc::new(PostgreSqlDialect::default()),
        DatabaseType::OpenGauss => Arc::new(OpenGaussDialect::default()),
    }
}
