//! Generic exponential-backoff retry around any fallible async operation.
//!
//! Every fetch call site delegates here instead of hand-rolling retry loops.
//! The error is rethrown unmodified after exhausting attempts so callers can
//! pattern-match on its type.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Delay before the second attempt; doubles per attempt.
    pub initial_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
    /// Checked between attempts, not mid-attempt: an in-progress operation is
    /// never forcibly aborted, but no further retries are scheduled once the
    /// token is cancelled.
    pub cancel: CancellationToken,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            cancel: CancellationToken::new(),
        }
    }
}

/// Run `operation` up to `max_retries + 1` times. `max_retries < 0` means
/// unbounded attempts. The operation receives the cancellation token and must
/// be safely re-runnable.
pub async fn retry<T, E, F, Fut>(
    mut operation: F,
    max_retries: i32,
    options: &RetryOptions,
) -> Result<T, E>
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = options.initial_delay;
    let mut attempt: i32 = 0;
    loop {
        match operation(options.cancel.clone()).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if max_retries >= 0 && attempt >= max_retries {
                    return Err(err);
                }
                if options.cancel.is_cancelled() {
                    log::warn!(
                        "retry cancelled after attempt {}: {}",
                        attempt + 1,
                        err
                    );
                    return Err(err);
                }
                log::warn!(
                    "attempt {} failed: {}; retrying in {}ms",
                    attempt + 1,
                    err,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(options.max_delay);
                attempt += 1;
            }
        }
    }
}
