use std::future::Future;

use crate::error::ScalingResult;
use crate::importer::sql::SqlStatement;

/// Write side of the import stage.
///
/// Implementations own the connection to the target database.
pub trait ImportTarget {
    /// Executes `statements` in order as one transaction and returns the number of affected rows.
    ///
    /// On error nothing was applied. Errors of a transient kind make the importer retry the
    /// whole batch.
    fn execute(
        &self,
        statements: &[SqlStatement],
    ) -> impl Future<Output = ScalingResult<u64>> + Send;
}
