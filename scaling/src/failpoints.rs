use fail::fail_point;

use crate::bail;
use crate::error::{ErrorKind, ScalingResult};

/// Importer, after a batch was applied and before its checkpoint is persisted.
pub const BEFORE_CHECKPOINT_PERSIST_FP: &str = "importer.before_checkpoint_persist";

/// Importer, after the checkpoint was persisted and before the channel is acknowledged.
pub const BEFORE_CHANNEL_ACK_FP: &str = "importer.before_channel_ack";

/// Inventory dumper, before each page is read from the source.
pub const INVENTORY_PAGE_FETCH_FP: &str = "inventory_dumper.page_fetch";

/// Evaluates the failpoint `name`, returning an error when it is configured to `return`.
///
/// The optional parameter picks the kind: `transient` or `fatal` (the default).
pub fn scaling_fail_point(name: &str) -> ScalingResult<()> {
    fail_point!(name, |parameter| {
        let error_kind = match parameter.as_deref() {
            Some("transient") => ErrorKind::WithTransientFailure,
            _ => ErrorKind::WithFatalFailure,
        };

        bail!(
            error_kind,
            "An error occurred in a fail point",
            format!("The failpoint '{name}' returned an error")
        );
    });

    Ok(())
}
