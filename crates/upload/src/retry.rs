//! Retry with exponential backoff for transient backend failures.

use ferry_core::config::RetryConfig;
use ferry_storage::StorageError;
use std::future::Future;
use std::time::Duration;

/// Errors that know whether repeating the call may help.
pub trait Retryable: std::fmt::Display {
    fn is_retryable(&self) -> bool;
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        StorageError::is_retryable(self)
    }
}

impl Retryable for crate::UploadError {
    fn is_retryable(&self) -> bool {
        crate::UploadError::is_retryable(self)
    }
}

/// Run `operation` until it succeeds, fails permanently, or runs out of attempts.
///
/// The delay starts at `base_delay_ms` and doubles after every failed attempt.
pub async fn retry_with_backoff<T, E, F, Fut>(
    config: &RetryConfig,
    name: &str,
    mut operation: F,
) -> Result<T, E>
where
    E: Retryable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut delay = Duration::from_millis(config.base_delay_ms);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                tracing::warn!(
                    operation = name,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
