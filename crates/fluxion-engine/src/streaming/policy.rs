//! Retry loop shared by enrichment calls, sink writes and source polls.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use fluxion_types::config::StreamingErrorPolicy;
use tokio_util::sync::CancellationToken;

use crate::errors::{compute_backoff, Retryable};

/// Run `attempt` until it succeeds, fails with a non-retryable error, or
/// `policy.max_retries` retries are used up. `attempt` receives the 1-based
/// attempt number. Backoff sleeps end early on cancellation, returning the
/// last error.
pub(crate) async fn retry_with_policy<T, E, F, Fut>(
    policy: &StreamingErrorPolicy,
    cancel: &CancellationToken,
    operation: &str,
    mut attempt: F,
) -> Result<T, E>
where
    E: Retryable + Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt_no: u32 = 0;
    loop {
        attempt_no += 1;
        let err = match attempt(attempt_no).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !err.is_retryable() || attempt_no > policy.max_retries {
            return Err(err);
        }
        let delay = compute_backoff(&policy.backoff, attempt_no);
        tracing::warn!(
            operation,
            attempt = attempt_no,
            max_retries = policy.max_retries,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "Retryable error, will retry"
        );
        if !sleep_unless_cancelled(delay, cancel).await {
            return Err(err);
        }
    }
}

/// Returns `false` if the token fired before the delay elapsed.
pub(crate) async fn sleep_unless_cancelled(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use fluxion_types::config::BackoffStrategy;
    use fluxion_types::error::SinkError;

    use super::*;

    #[tokio::test]
    async fn retries_transient_until_success() {
        let policy = StreamingErrorPolicy::retrying(2, BackoffStrategy::None);
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result = retry_with_policy(&policy, &CancellationToken::new(), "sink write", move |n| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            if n < 3 {
                Err(SinkError::transient("reset"))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let policy = StreamingErrorPolicy::retrying(1, BackoffStrategy::Fixed { delay_ms: 1 });
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: Result<(), _> =
            retry_with_policy(&policy, &CancellationToken::new(), "sink write", move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SinkError::transient("reset"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn terminal_errors_are_not_retried() {
        let policy = StreamingErrorPolicy::retrying(5, BackoffStrategy::None);
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: Result<(), _> =
            retry_with_policy(&policy, &CancellationToken::new(), "sink write", move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SinkError::rejected("bad record"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let policy = StreamingErrorPolicy::retrying(
            3,
            BackoffStrategy::Fixed { delay_ms: 60_000 },
        );
        let token = CancellationToken::new();
        token.cancel();
        let started = std::time::Instant::now();
        let result: Result<(), _> = retry_with_policy(&policy, &token, "sink write", |_| async {
            Err(SinkError::transient("reset"))
        })
        .await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
