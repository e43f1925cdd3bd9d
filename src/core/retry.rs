//! Retry policy for transient broker failures
//!
//! [`RetryPolicy::decide`] is the pure decision function: given the error
//! class, the time elapsed since the first attempt and the retry number it
//! says whether to try again and after which delay. [`retry_async`] drives
//! an async broker call with that policy and honours cancellation between
//! attempts.

use crate::broker::api::{BrokerError, BrokerResult, ErrorClass};
use crate::core::shutdown::ShutdownCoordinator;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Exponential backoff policy with a global deadline
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial: Duration,
    /// Growth factor applied per retry
    pub multiplier: f64,
    /// Upper bound on any single delay
    pub maximum: Duration,
    /// No retry is scheduled once this much time has passed since the first attempt
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            multiplier: 1.45,
            maximum: Duration::from_secs(90),
            deadline: Duration::from_secs(300),
        }
    }
}

/// Outcome of [`RetryPolicy::decide`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

impl RetryPolicy {
    /// Backoff delay for the given retry number (0 for the first retry)
    ///
    /// `min(maximum, initial * multiplier^attempt)`, never below `initial`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.maximum.as_secs_f64() {
            return self.maximum.max(self.initial);
        }
        Duration::from_secs_f64(secs).max(self.initial)
    }

    /// Decide whether a failed call should be retried
    pub fn decide(&self, class: ErrorClass, elapsed: Duration, attempt: u32) -> RetryDecision {
        if elapsed >= self.deadline || !class.is_transient() {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.backoff(attempt))
    }
}

/// Terminal failure of a retried operation
#[derive(Debug, Clone, thiserror::Error)]
pub enum RetryError {
    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    Permanent {
        operation: String,
        source: BrokerError,
        attempts: u32,
    },

    #[error("{operation} exceeded the {deadline:?} retry deadline after {attempts} attempt(s): {last}")]
    DeadlineExceeded {
        operation: String,
        #[source]
        last: BrokerError,
        attempts: u32,
        deadline: Duration,
    },

    #[error("{operation} cancelled after {attempts} attempt(s): {last}")]
    Cancelled {
        operation: String,
        #[source]
        last: BrokerError,
        attempts: u32,
    },
}

impl RetryError {
    /// The broker error returned by the final attempt
    pub fn last_error(&self) -> &BrokerError {
        match self {
            RetryError::Permanent { source, .. } => source,
            RetryError::DeadlineExceeded { last, .. } | RetryError::Cancelled { last, .. } => last,
        }
    }

    /// Number of attempts made, including the first
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Permanent { attempts, .. }
            | RetryError::DeadlineExceeded { attempts, .. }
            | RetryError::Cancelled { attempts, .. } => *attempts,
        }
    }
}

/// Successful result of a retried operation
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome<T> {
    pub value: T,
    /// Number of attempts made, including the successful one
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Information passed to the observer before each retry
#[derive(Debug, Clone)]
pub struct RetryNotice<'a> {
    pub operation: &'a str,
    pub error: &'a BrokerError,
    /// Retry number, 0 for the first retry
    pub retry: u32,
    pub delay: Duration,
}

/// Execute an async broker operation under a [`RetryPolicy`]
///
/// The closure receives the 1-based attempt number. Once `shutdown` has been
/// triggered no further attempt is started; an attempt already in flight is
/// allowed to finish.
///
/// # Examples
/// ```rust
/// use pubsub_dispatch::core::retry::{retry_async, RetryPolicy};
/// use pubsub_dispatch::core::shutdown::ShutdownCoordinator;
/// use pubsub_dispatch::broker::api::BrokerResult;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let shutdown = ShutdownCoordinator::new();
/// let outcome = retry_async("publish", &RetryPolicy::default(), &shutdown, |_attempt| async {
///     BrokerResult::Ok("id-1".to_string())
/// })
/// .await?;
/// assert_eq!(outcome.attempts, 1);
/// # Ok(())
/// # }
/// ```
pub async fn retry_async<F, Fut, T>(
    operation_name: &str,
    policy: &RetryPolicy,
    shutdown: &ShutdownCoordinator,
    operation: F,
) -> Result<RetryOutcome<T>, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = BrokerResult<T>>,
{
    retry_async_observed(operation_name, policy, shutdown, operation, |_| {}).await
}

/// [`retry_async`] with a callback invoked before every scheduled retry
pub async fn retry_async_observed<F, Fut, T, O>(
    operation_name: &str,
    policy: &RetryPolicy,
    shutdown: &ShutdownCoordinator,
    mut operation: F,
    mut on_retry: O,
) -> Result<RetryOutcome<T>, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = BrokerResult<T>>,
    O: FnMut(RetryNotice<'_>),
{
    let started = Instant::now();
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let error = match operation(attempts).await {
            Ok(value) => {
                return Ok(RetryOutcome {
                    value,
                    attempts,
                    elapsed: started.elapsed(),
                })
            }
            Err(error) => error,
        };

        let retry = attempts - 1;
        let delay = match policy.decide(error.class, started.elapsed(), retry) {
            RetryDecision::Retry(delay) => delay,
            RetryDecision::GiveUp if error.is_transient() => {
                return Err(RetryError::DeadlineExceeded {
                    operation: operation_name.to_string(),
                    last: error,
                    attempts,
                    deadline: policy.deadline,
                })
            }
            RetryDecision::GiveUp => {
                return Err(RetryError::Permanent {
                    operation: operation_name.to_string(),
                    source: error,
                    attempts,
                })
            }
        };

        if shutdown.is_shutdown_requested() {
            return Err(RetryError::Cancelled {
                operation: operation_name.to_string(),
                last: error,
                attempts,
            });
        }

        log::debug!(
            "Operation '{}' failed on attempt {} with {}, retrying in {:.3}s",
            operation_name,
            attempts,
            error.class,
            delay.as_secs_f64()
        );
        on_retry(RetryNotice {
            operation: operation_name,
            error: &error,
            retry,
            delay,
        });

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => {
                log::debug!("Operation '{}' cancelled while waiting to retry", operation_name);
                return Err(RetryError::Cancelled {
                    operation: operation_name.to_string(),
                    last: error,
                    attempts,
                });
            }
        }
    }
}
