//! Best-effort side effects.
//!
//! Ledger mutations are fatal on failure and roll back. Side effects that run
//! after a commit (payment notifications) are not: their failures are logged
//! here and swallowed, so the committed ledger change always stands.

use crate::errors::Result;
use std::future::Future;
use tracing::warn;

/// Runs a side effect, logging and discarding its error.
///
/// Returns `Some` with the side effect's value on success, `None` on failure.
pub async fn best_effort<F, T>(label: &'static str, side_effect: F) -> Option<T>
where
    F: Future<Output = Result<T>>,
{
    match side_effect.await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(side_effect = label, error = %e, "Best-effort side effect failed; ledger change kept");
            None
        }
    }
}
