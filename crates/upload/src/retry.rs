//! Retrying operations that lost a range-lock race.

use crate::error::UploadResult;
use splice_core::config::LockRetryConfig;
use std::future::Future;

/// Run `op`, retrying with exponential backoff while it fails with
/// [`UploadError::LockContention`](crate::UploadError::LockContention).
///
/// Makes at most `policy.max_attempts` calls; any other error returns
/// immediately.
pub async fn retry_on_contention<F, Fut, T>(policy: &LockRetryConfig, mut op: F) -> UploadResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = UploadResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_lock_contention() && attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Lock contention; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}
