use std::fmt;
use std::str::FromStr;

use crate::bail;
use crate::error::{ErrorKind, ScalingError};

/// Database products that can act as a source or a target of a scaling job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseType {
    MySql,
    PostgreSql,
    OpenGauss,
    H2,
}

impl DatabaseType {
    pub fn name(&self) -> &'static str {
        match self {
            DatabaseType::MySql => "MySQL",
            DatabaseType::PostgreSql => "PostgreSQL",
            DatabaseType::OpenGauss => "openGauss",
            DatabaseType::H2 => "H2",
        }
    }

    /// Returns `true` for products that qualify tables with a schema.
    pub fn is_schema_aware(&self) -> bool {
        matches!(self, DatabaseType::PostgreSql | DatabaseType::OpenGauss)
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DatabaseType {
    type Err = ScalingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mysql" => Ok(DatabaseType::MySql),
            "postgresql" => Ok(DatabaseType::PostgreSql),
            "opengauss" => Ok(DatabaseType::OpenGauss),
            "h2" => Ok(DatabaseType::H2),
            _ => bail!(
                ErrorKind::ConfigError,
                "Unsupported database type",
                s.to_string()
            ),
        }
    }
}
