//! Fail-open helpers for best-effort side channels
//!
//! The activity log and other observability writes must never fail a ledger
//! operation. Anything touching task status, phase locks or the budget ledger
//! propagates its errors instead.

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Run a best-effort async operation, logging and swallowing its error.
///
/// ```no_run
/// use phasegate_core::fail_open::fail_open;
/// use phasegate_core::Result;
///
/// async fn append_activity() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let written = fail_open("activity_log", || append_activity()).await;
///     assert!(written.is_some());
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!(operation = operation_name, error = %e, "best-effort operation failed");
            None
        }
    }
}
