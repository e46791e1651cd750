use fail::fail_point;

use crate::bail;
use crate::error::{ConduitResult, ErrorKind};

pub const BEFORE_BATCH_WRITE: &str = "before_batch_write";
pub const BEFORE_POOL_CREATE: &str = "before_pool_create";

/// Evaluates the named fail point, returning an error when it is configured with `return`.
///
/// The optional parameter selects the error class: `transient` produces a retryable error,
/// anything else a fatal one.
pub fn conduit_fail_point(name: &str) -> ConduitResult<()> {
    fail_point!(name, |parameter| {
        let error_kind = match parameter.as_deref() {
            Some("transient") => ErrorKind::InjectedTransient,
            _ => ErrorKind::InjectedFatal,
        };

        bail!(
            error_kind,
            "An error occurred in a fail point",
            format!("The failpoint '{name}' returned an error")
        );
    });

    Ok(())
}
