//! Bounded exponential backoff around handler invocation.
//!
//! ```text
//! attempt   delay before next attempt (base = 1s)
//! ────────────────────────────────────────────
//!    1        1s
//!    2        2s
//!    3        -- exhausted (max_attempts = 3)
//! ```
//!
//! The retry loop keeps its state (attempt counter and current delay) in
//! plain local variables so the schedule can be checked on its own through
//! [`RetryPolicy::schedule`].

use std::{future::Future, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);

/// Attempt limit and backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self::default()
            .with_max_attempts(max_attempts)
            .with_base_delay(base_delay)
    }

    /// Total number of invocations, including the first. Clamped to at least 1.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Upper bound for a single backoff wait.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Delay that follows `delay` in the schedule.
    pub fn next_delay(&self, delay: Duration) -> Duration {
        delay.saturating_mul(2).min(self.max_delay)
    }

    /// Waits between consecutive attempts, `max_attempts - 1` entries long.
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + use<> {
        let policy = *self;
        std::iter::successors(Some(policy.base_delay.min(policy.max_delay)), move |d| {
            Some(policy.next_delay(*d))
        })
        .take(policy.max_attempts as usize - 1)
    }
}

/// Invoke `attempt_fn` until it succeeds, the policy is exhausted, or
/// `cancel` fires during a backoff wait.
///
/// `attempt_fn` receives the 1-based attempt number. `on_retry` is called
/// after every failed attempt that will be followed by another one, with the
/// failed attempt number, the upcoming delay and the error.
///
/// Returns the number of attempts used on success.
pub async fn retry_with_backoff<F, Fut, R>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut attempt_fn: F,
    mut on_retry: R,
) -> Result<u32, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<(), tower::BoxError>>,
    R: FnMut(u32, Duration, &tower::BoxError),
{
    let mut attempt = 1;
    let mut delay = policy.base_delay.min(policy.max_delay);

    loop {
        let error = match attempt_fn(attempt).await {
            Ok(()) => return Ok(attempt),
            Err(error) => error,
        };

        if attempt >= policy.max_attempts {
            return Err(RetryError::exhausted(attempt, error));
        }

        on_retry(attempt, delay, &error);

        if cancel.is_cancelled() {
            return Err(RetryError::cancelled(attempt, error));
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::cancelled(attempt, error)),
            _ = tokio::time::sleep(delay) => {}
        }

        delay = policy.next_delay(delay);
        attempt += 1;
    }
}

/// Error returned when a retried operation does not succeed.
#[derive(Debug)]
pub struct RetryError {
    context: SpanTrace,
    attempts: u32,
    kind: RetryErrorKind,
}

/// Why the retry sequence ended.
#[derive(Debug)]
pub enum RetryErrorKind {
    /// Every attempt failed; holds the last error.
    Exhausted(tower::BoxError),
    /// Cancellation fired before the next attempt; holds the last error.
    Cancelled(tower::BoxError),
}

impl RetryError {
    fn exhausted(attempts: u32, source: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            attempts,
            kind: RetryErrorKind::Exhausted(source),
        }
    }

    fn cancelled(attempts: u32, source: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            attempts,
            kind: RetryErrorKind::Cancelled(source),
        }
    }

    /// Number of invocations made before giving up.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn kind(&self) -> &RetryErrorKind {
        &self.kind
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, RetryErrorKind::Cancelled(_))
    }

    /// The error returned by the last attempt.
    pub fn last_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        match &self.kind {
            RetryErrorKind::Exhausted(err) | RetryErrorKind::Cancelled(err) => err.as_ref(),
        }
    }
}

impl std::fmt::Display for RetryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            RetryErrorKind::Exhausted(err) => {
                writeln!(f, "Failed after {} attempts: {err}", self.attempts)
            }
            RetryErrorKind::Cancelled(err) => writeln!(
                f,
                "Cancelled after {} attempts, last error: {err}",
                self.attempts
            ),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for RetryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.last_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    fn counting(
        fail_until: u32,
    ) -> (
        Arc<AtomicU32>,
        impl FnMut(u32) -> std::future::Ready<Result<(), tower::BoxError>>,
    ) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let attempt_fn = move |_attempt| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(if n < fail_until {
                Err("transient".into())
            } else {
                Ok(())
            })
        };
        (calls, attempt_fn)
    }

    #[test]
    fn schedule_doubles_from_base_delay() {
        let policy = RetryPolicy::new(4, Duration::from_secs(1));
        let delays: Vec<_> = policy.schedule().collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[test]
    fn schedule_is_capped_by_max_delay() {
        let policy = RetryPolicy::new(5, Duration::from_secs(10))
            .with_max_delay(Duration::from_secs(15));
        let delays: Vec<_> = policy.schedule().collect();

        assert_eq!(delays.last(), Some(&Duration::from_secs(15)));
        assert_eq!(delays.len(), 4);
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        let policy = RetryPolicy::new(0, Duration::from_secs(1));
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.schedule().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn success_on_first_attempt_does_not_retry() {
        let (calls, attempt_fn) = counting(1);
        let attempts = retry_with_backoff(
            &RetryPolicy::default(),
            &CancellationToken::new(),
            attempt_fn,
            |_, _, _| {},
        )
        .await
        .unwrap();

        assert_eq!(attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_on_attempt_k_invokes_exactly_k_times() {
        let (calls, attempt_fn) = counting(3);
        let mut delays = Vec::new();
        let started = tokio::time::Instant::now();

        let attempts = retry_with_backoff(
            &RetryPolicy::default(),
            &CancellationToken::new(),
            attempt_fn,
            |_, delay, _| delays.push(delay),
        )
        .await
        .unwrap();

        assert_eq!(attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(2)]);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_return_last_error_with_attempt_count() {
        let (calls, attempt_fn) = counting(u32::MAX);

        let err = retry_with_backoff(
            &RetryPolicy::default(),
            &CancellationToken::new(),
            attempt_fn,
            |_, _, _| {},
        )
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.attempts(), 3);
        assert!(!err.is_cancelled());
        assert_eq!(err.last_error().to_string(), "transient");
        assert!(err.to_string().starts_with("Failed after 3 attempts: transient"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_token_aborts_before_first_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (calls, attempt_fn) = counting(u32::MAX);

        let err = retry_with_backoff(
            &RetryPolicy::new(3, Duration::from_secs(1)),
            &cancel,
            attempt_fn,
            |_, _, _| {},
        )
        .await
        .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(err.attempts(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_aborts_immediately() {
        let cancel = CancellationToken::new();
        let (calls, attempt_fn) = counting(u32::MAX);
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let started = tokio::time::Instant::now();

        let err = retry_with_backoff(
            &RetryPolicy::new(3, Duration::from_secs(60)),
            &cancel,
            attempt_fn,
            |_, _, _| {},
        )
        .await
        .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(60));
    }
}
