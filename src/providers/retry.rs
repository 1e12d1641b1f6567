use crate::error::{GatewayError, Result};
use std::time::Duration;
use tracing::warn;

/// Maximum backoff cap to prevent excessively long waits.
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Whether a failed upstream call is worth repeating.
///
/// Transport failures (no status) and rate limiting / server errors are
/// transient. Oversized chunks and malformed responses would fail the same
/// way again, and every other error is a caller or configuration problem.
pub fn is_retryable(err: &GatewayError) -> bool {
    match err {
        GatewayError::UpstreamUnavailable { status: None, .. } => true,
        GatewayError::UpstreamUnavailable {
            status: Some(code), ..
        } => matches!(code, 408 | 429 | 500 | 502 | 503 | 504 | 529),
        _ => false,
    }
}

/// Retry an async operation with exponential backoff.
///
/// Starts with `initial_delay` and doubles it each attempt, capping at 30 seconds.
/// Only errors accepted by [`is_retryable`] are retried; anything else is
/// returned immediately.
///
/// # Arguments
/// * `max_retries` - Maximum number of retry attempts (0 means execute once with no retries)
/// * `initial_delay` - The delay before the first retry
/// * `f` - The async closure to retry
pub async fn retry_with_backoff<F, Fut, T>(
    max_retries: u32,
    initial_delay: Duration,
    f: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = initial_delay;
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(val) => return Ok(val),
            Err(err) => {
                if attempt >= max_retries || !is_retryable(&err) {
                    return Err(err);
                }

                warn!(
                    attempt = attempt + 1,
                    attempts = max_retries + 1,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "Upstream call failed, retrying"
                );

                tokio::time::sleep(delay).await;

                delay = (delay * 2).min(MAX_DELAY);
                attempt += 1;
            }
        }
    }
}
