use std::{
    future::Future,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use tokio_retry::RetryIf;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::AppError;

/// `base × 1, base × 2, ...`: one delay per retry after the first attempt,
/// so `max_attempts` counts every call including the first.
pub fn linear_backoff(base: Duration, max_attempts: usize) -> impl Iterator<Item = Duration> {
    (1..max_attempts).map(move |attempt| base.saturating_mul(attempt as u32))
}

/// `min(initial × 2^attempt, max)` for `attempt` in `0..max_retries`.
pub fn capped_exponential_backoff(
    initial: Duration,
    max: Duration,
    max_retries: usize,
) -> impl Iterator<Item = Duration> {
    (0..max_retries).map(move |attempt| {
        let factor = 2u32.saturating_pow(attempt as u32);
        initial.saturating_mul(factor).min(max)
    })
}

/// Runs `action` until it succeeds, the delays run out, or `cancel` fires.
///
/// Permanent errors (see [`AppError::is_permanent`]) are returned on first sight.
/// Exhausted transient failures are wrapped in [`AppError::RetriesExhausted`].
pub async fn retry_with_cancel<T, S, F, Fut>(
    strategy: S,
    cancel: &CancellationToken,
    label: &str,
    mut action: F,
) -> Result<T, AppError>
where
    S: IntoIterator<Item = Duration>,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let attempts = AtomicUsize::new(0);

    let retry = RetryIf::spawn(
        strategy,
        || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > 1 {
                debug!(operation = label, attempt, "retrying");
            }
            action()
        },
        |err: &AppError| !err.is_permanent(),
    );

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(AppError::Cancelled),
        outcome = retry => outcome,
    };

    outcome.map_err(|err| {
        if err.is_permanent() {
            err
        } else {
            AppError::RetriesExhausted {
                attempts: attempts.load(Ordering::SeqCst),
                last_error: Box::new(err),
            }
        }
    })
}
