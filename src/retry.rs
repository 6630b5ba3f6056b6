//! Bounded retry combinator.
//!
//! Operations report each failed attempt as an [`Attempt`], which tells the
//! combinator whether to try again after the policy delay, try again after a
//! caller-provided delay, or give up at once.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// How many times to run an operation and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Fixed delay applied after an [`Attempt::Retry`].
    pub delay: Duration,
}

impl RetryPolicy {
    /// Default attempts for tunnel process IPC.
    pub const IPC_MAX_ATTEMPTS: u32 = 5;

    /// Default delay between tunnel process IPC attempts.
    pub const IPC_DELAY: Duration = Duration::from_secs(1);

    /// Create a policy.
    #[must_use]
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Transient IPC delivery failures: 5 attempts, 1 second apart.
    #[must_use]
    pub const fn ipc() -> Self {
        Self::new(Self::IPC_MAX_ATTEMPTS, Self::IPC_DELAY)
    }

    /// A single immediate second attempt.
    #[must_use]
    pub const fn once_more() -> Self {
        Self::new(2, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::ipc()
    }
}

/// Outcome of a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<E> {
    /// Transient; retry after the policy delay.
    Retry(E),
    /// Transient; retry no sooner than the given delay.
    RetryAfter(E, Duration),
    /// Terminal; return the error without retrying.
    Fail(E),
}

/// Run `op` until it succeeds, fails terminally, or the policy is exhausted.
///
/// `op` receives the 1-based attempt number. When the budget runs out the
/// error from the last attempt is returned.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Attempt<E>>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let wait = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(Attempt::Fail(e)) => return Err(e),
            Err(Attempt::Retry(e)) if attempt >= max_attempts => return Err(e),
            Err(Attempt::RetryAfter(e, _)) if attempt >= max_attempts => return Err(e),
            Err(Attempt::Retry(_)) => policy.delay,
            Err(Attempt::RetryAfter(_, delay)) => delay,
        };

        debug!(
            "Attempt {}/{} failed, retrying in {:?}",
            attempt, max_attempts, wait
        );
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_budget_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let result: Result<(), &str> = retry(RetryPolicy::ipc(), |_| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Attempt::Retry("unreachable"))
            }
        })
        .await;

        assert_eq!(result, Err("unreachable"));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        // Four gaps between five attempts.
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let result: Result<u32, &str> = retry(RetryPolicy::ipc(), |attempt| async move {
            if attempt < 3 {
                Err(Attempt::Retry("busy"))
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), &str> = retry(RetryPolicy::ipc(), |_| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Attempt::Fail("rejected"))
            }
        })
        .await;

        assert_eq!(result, Err("rejected"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_uses_provided_delay() {
        let started = Instant::now();

        let result: Result<(), &str> = retry(RetryPolicy::new(2, Duration::from_secs(1)), |_| async {
            Err(Attempt::RetryAfter("slow down", Duration::from_secs(30)))
        })
        .await;

        assert_eq!(result, Err("slow down"));
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_once_more_runs_twice_without_delay() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), u32> = retry(RetryPolicy::once_more(), |attempt| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Attempt::Retry(attempt))
            }
        })
        .await;

        assert_eq!(result, Err(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
