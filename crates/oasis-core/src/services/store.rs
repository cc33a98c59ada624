//! Bounded store calls and read retries

use std::future::Future;

use tracing::warn;

use crate::config::OasisConfig;
use crate::error::{OasisError, OasisResult};

/// Run a store call under the configured operation timeout.
///
/// Wrap statements only. Mutations hand the open transaction back and commit
/// outside, so an elapsed timer can never report a failure for a write that landed.
pub(crate) async fn bounded<T, F>(config: &OasisConfig, call: F) -> OasisResult<T>
where
    F: Future<Output = OasisResult<T>>,
{
    match tokio::time::timeout(config.operation_timeout(), call).await {
        Ok(result) => result,
        Err(_) => Err(OasisError::Transient(format!(
            "store call exceeded {} ms",
            config.operation_timeout_ms
        ))),
    }
}

/// Retry a read-only call on transient failures. Never use this for mutations.
pub(crate) async fn read_with_retry<T, F, Fut>(
    config: &OasisConfig,
    operation: &str,
    mut call: F,
) -> OasisResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = OasisResult<T>>,
{
    let attempts = config.read_retry_attempts.max(1);
    let mut attempt = 1;
    loop {
        match bounded(config, call()).await {
            Err(e) if e.is_retriable() && attempt < attempts => {
                warn!(operation, attempt, error = %e, "Transient read failure, retrying");
                tokio::time::sleep(config.read_retry_backoff() * attempt).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Unique-index violations surface as typed errors instead of `Database`
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}
