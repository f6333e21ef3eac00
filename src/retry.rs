//! Bounded retry with exponential backoff for publish attempts.
//!
//! The relay wraps every broker publish in a [`RetryPolicy`]. The policy
//! only ever sees transient failures: non-transient decode errors are
//! filtered out before the retry stage and never enter the loop. Each
//! envelope's retry budget is independent; a broker outage makes every
//! in-flight envelope exhaust its own budget, there is no shared breaker.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

/// Bounded retry with exponential backoff.
///
/// Attempt `n` (1-based) that fails is followed by a wait of
/// `base_delay * 2^(n-1)` before attempt `n + 1`, until `max_attempts`
/// have been spent. The backoff wait races the cancellation token; a
/// cancelled wait abandons the operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempt budget, including the first attempt.
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles per retry.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Backoff to wait after the given failed attempt (1-based).
    fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    /// Run `op` until it succeeds, the budget is exhausted, or `cancel`
    /// fires during a backoff wait.
    ///
    /// On exhaustion the last failure is surfaced so the caller can record
    /// it as the terminal error.
    pub async fn run<F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<(), RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), tower::BoxError>>,
    {
        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    // A failed attempt after cancellation fired is an
                    // aborted attempt, not a spent budget; the caller
                    // abandons the envelope unmutated.
                    if cancel.is_cancelled() {
                        return Err(RetryError::cancelled());
                    }
                    if attempt >= self.max_attempts {
                        tracing::warn!(
                            attempt,
                            error = %err,
                            "publish attempt failed, retry budget exhausted"
                        );
                        return Err(RetryError::exhausted(err));
                    }

                    let delay = self.delay_after(attempt);
                    tracing::warn!(
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %err,
                        "publish attempt failed, backing off"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(RetryError::cancelled()),
                    }
                    attempt += 1;
                }
            }
        }
    }
}

/// Error returned when a retried operation does not succeed.
#[derive(Debug)]
pub struct RetryError {
    context: SpanTrace,
    kind: RetryErrorKind,
}

/// Kinds of retry outcomes that are not success.
#[derive(Debug)]
pub enum RetryErrorKind {
    /// The budget is spent; carries the last attempt's failure.
    Exhausted(tower::BoxError),
    /// Cancellation fired during a backoff wait.
    Cancelled,
}

impl RetryError {
    fn exhausted(last: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: RetryErrorKind::Exhausted(last),
        }
    }

    fn cancelled() -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: RetryErrorKind::Cancelled,
        }
    }

    /// Which kind of retry failure this is.
    pub fn kind(&self) -> &RetryErrorKind {
        &self.kind
    }

    /// Consume the error, returning the last attempt's failure if the
    /// budget was exhausted.
    pub(crate) fn into_kind(self) -> RetryErrorKind {
        self.kind
    }
}

impl std::fmt::Display for RetryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            RetryErrorKind::Exhausted(err) => writeln!(f, "retry budget exhausted: {err}"),
            RetryErrorKind::Cancelled => writeln!(f, "cancelled during backoff"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for RetryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            RetryErrorKind::Exhausted(err) => Some(err.as_ref()),
            RetryErrorKind::Cancelled => None,
        }
    }
}
