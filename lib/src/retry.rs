//! Bounded retries with a per-attempt timeout and a backoff between attempts.
//!
//! Used for both BLE link stages (discovery and connection), but knows
//! nothing about BLE: the operation is any future-producing closure.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use log::warn;
use tokio_util::sync::CancellationToken;

/// Delay between a failed attempt and the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// Doubles after every failed attempt, starting at `initial`, capped at
    /// `max`.
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { initial, max } => {
                let factor = 1u32
                    .checked_shl(attempt.saturating_sub(1))
                    .unwrap_or(u32::MAX);
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, the first one included.
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, attempt_timeout: Duration, delay: Duration) -> Self {
        Self {
            max_attempts,
            attempt_timeout,
            backoff: Backoff::Fixed(delay),
        }
    }
}

/// How a single attempt went wrong.
#[derive(Debug, PartialEq, Eq)]
pub enum AttemptError<E> {
    Failed(E),
    TimedOut(Duration),
}

impl<E: fmt::Display> fmt::Display for AttemptError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Failed(e) => e.fmt(f),
            AttemptError::TimedOut(after) => write!(f, "timed out after {after:?}"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    /// Every attempt failed; `last` is the final attempt's error.
    Exhausted { attempts: u32, last: AttemptError<E> },
    Cancelled { attempts: u32 },
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempts: {last}")
            }
            RetryError::Cancelled { attempts } => write!(f, "cancelled during attempt {attempts}"),
        }
    }
}

/// Run `op` until it succeeds, `policy.max_attempts` attempts have failed, or
/// `cancel` fires. `op` receives the 1-based attempt number.
///
/// Each attempt is bounded by `policy.attempt_timeout`; an attempt that runs
/// over counts as failed.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    stage: &str,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempts: attempt }),
            res = tokio::time::timeout(policy.attempt_timeout, op(attempt)) => res,
        };
        let err = match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => AttemptError::Failed(e),
            Err(_) => AttemptError::TimedOut(policy.attempt_timeout),
        };

        if attempt >= max_attempts {
            warn!("{stage}: attempt {attempt}/{max_attempts} failed: {err}, giving up");
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: err,
            });
        }

        let delay = policy.backoff.delay(attempt);
        warn!("{stage}: attempt {attempt}/{max_attempts} failed: {err}, retrying in {delay:?}");
        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempts: attempt }),
            _ = tokio::time::sleep(delay) => {},
        }
    }
}
