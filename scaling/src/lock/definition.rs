use std::fmt;

/// Root of every lock key in the coordination service.
pub const LOCK_ROOT: &str = "/lock";

/// A lockable resource.
///
/// Both kinds share one lock implementation under [`LOCK_ROOT`], each in its own subtree, so a
/// job id can never name the same key as a database.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockDefinition {
    /// Guards schema changes of a logical database.
    Database { database_name: String },
    /// Admits a single running instance of a scaling job.
    Job { job_id: String },
}

impl LockDefinition {
    pub fn database(database_name: impl Into<String>) -> Self {
        LockDefinition::Database {
            database_name: database_name.into(),
        }
    }

    pub fn job(job_id: impl Into<String>) -> Self {
        LockDefinition::Job {
            job_id: job_id.into(),
        }
    }

    /// Returns the key the lock is stored under.
    pub fn lock_key(&self) -> String {
        match self {
            LockDefinition::Database { database_name } => {
                format!("{LOCK_ROOT}/database/{database_name}")
            }
            LockDefinition::Job { job_id } => format!("{LOCK_ROOT}/job/{job_id}"),
        }
    }
}

impl fmt::Display for LockDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.lock_key())
    }
}
