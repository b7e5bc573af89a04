//! Retry executor
//!
//! Runs a fallible async operation until it succeeds, the attempt budget is
//! spent, or the caller cancels. The wait between attempts comes from a
//! pluggable [`DelayStrategy`]: a fixed delay by default, or exponential
//! backoff via [`BackoffPolicy`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::utils::backoff::BackoffPolicy;

/// Decides how long to wait after a failed attempt.
pub trait DelayStrategy: Send + Sync + fmt::Debug {
    /// Delay after the failure of attempt number `attempt` (zero-based).
    fn delay(&self, attempt: u32) -> Duration;

    /// Lets a strategy end retrying before the attempt budget is spent.
    fn should_stop(&self, _started: Instant) -> bool {
        false
    }
}

/// The same delay between every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay(pub Duration);

impl DelayStrategy for FixedDelay {
    fn delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}

impl DelayStrategy for BackoffPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.next_interval(attempt)
    }

    fn should_stop(&self, started: Instant) -> bool {
        self.is_elapsed(started)
    }
}

/// Attempt budget plus delay strategy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub strategy: Arc<dyn DelayStrategy>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_millis(100))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, strategy: Arc<dyn DelayStrategy>) -> Self {
        Self {
            max_attempts,
            strategy,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::new(max_attempts, Arc::new(FixedDelay(delay)))
    }

    pub fn exponential(max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self::new(max_attempts, Arc::new(backoff))
    }
}

/// Why a retried operation did not succeed.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed; only the final cause is kept.
    Exhausted { attempts: u32, last: E },
    /// The caller cancelled while the executor was waiting.
    Cancelled { attempts: u32, last: Option<E> },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Cancelled { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn into_last(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Cancelled { last, .. } => last,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted { attempts, last } => {
                write!(f, "retries exhausted after {} attempts: {}", attempts, last)
            }
            RetryError::Cancelled { attempts, .. } => {
                write!(f, "retry cancelled after {} attempts", attempts)
            }
        }
    }
}

impl<E> std::error::Error for RetryError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Cancelled { last: Some(last), .. } => Some(last),
            RetryError::Cancelled { last: None, .. } => None,
        }
    }
}

/// Executes operations under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct Retry {
    policy: RetryPolicy,
}

impl Retry {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds or the policy gives up.
    pub async fn run<T, E, F, Fut>(&self, operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.run_inner(operation, None).await
    }

    /// Like [`Retry::run`], but a fired `cancel` token aborts the wait
    /// between attempts.
    pub async fn run_with_cancel<T, E, F, Fut>(
        &self,
        operation: F,
        cancel: &CancellationToken,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.run_inner(operation, Some(cancel)).await
    }

    async fn run_inner<T, E, F, Fut>(
        &self,
        mut operation: F,
        cancel: Option<&CancellationToken>,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let started = Instant::now();

        if cancel.is_some_and(|token| token.is_cancelled()) {
            return Err(RetryError::Cancelled {
                attempts: 0,
                last: None,
            });
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(attempts = attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if attempt >= max_attempts || self.policy.strategy.should_stop(started) {
                warn!(
                    attempts = attempt,
                    max_attempts = max_attempts,
                    error = %error,
                    "retries exhausted"
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }

            let delay = self.policy.strategy.delay(attempt - 1);
            warn!(
                attempt = attempt,
                max_attempts = max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "operation failed, retrying"
            );

            match cancel {
                Some(token) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => {
                            info!(attempts = attempt, "retry cancelled during wait");
                            return Err(RetryError::Cancelled {
                                attempts: attempt,
                                last: Some(error),
                            });
                        }
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }
}

/// Run `operation` with the default policy (3 attempts, 100 ms apart).
pub async fn retry<T, E, F, Fut>(operation: F) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    Retry::default().run(operation).await
}
