//! Bounded exponential-backoff retry
//!
//! Retry behaviour is a value ([`RetryPolicy`]) plus an injected [`Sleeper`], so
//! the schedule can be exercised in tests without real delays.

use crate::error::DocpackError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Whether a failed attempt may be repeated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Fatal,
}

/// Attempt limit and backoff schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Cap for any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given zero-based failed attempt: `base * 2^attempt`, capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Blocks the current thread between attempts
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Real sleeper backed by `std::thread::sleep`
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Outcome of a failed retried operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// A fatal error, propagated without further attempts
    Fatal { attempts: u32, error: E },
    /// Every allowed attempt failed with a transient error
    Exhausted { attempts: u32, error: E },
}

impl<E> RetryError<E> {
    /// Number of attempts made
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Fatal { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    /// The last error seen
    pub fn into_inner(self) -> E {
        match self {
            Self::Fatal { error, .. } | Self::Exhausted { error, .. } => error,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fatal { error, .. } => write!(f, "{}", error),
            Self::Exhausted { attempts, error } => {
                write!(f, "gave up after {} attempts: {}", attempts, error)
            }
        }
    }
}

impl From<RetryError<DocpackError>> for DocpackError {
    fn from(err: RetryError<DocpackError>) -> Self {
        match err {
            RetryError::Fatal { error, .. } => error,
            RetryError::Exhausted { attempts, error } => DocpackError::RetriesExhausted {
                attempts,
                source: Box::new(error),
            },
        }
    }
}

/// Classify docpack errors for in-place retry
pub fn classify_error(err: &DocpackError) -> ErrorClass {
    if err.is_transient_io() {
        ErrorClass::Transient
    } else {
        ErrorClass::Fatal
    }
}

/// Runs fallible operations under a [`RetryPolicy`]
#[derive(Clone)]
pub struct RetryCoordinator {
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryCoordinator {
    /// Coordinator that really sleeps between attempts
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_sleeper(policy, Arc::new(ThreadSleeper))
    }

    /// Coordinator with an injected sleeper
    pub fn with_sleeper(policy: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { policy, sleeper }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails fatally, or runs out of attempts
    pub fn run<T, E, F, C>(&self, operation: F, classify: C) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Result<T, E>,
        C: Fn(&E) -> ErrorClass,
    {
        self.run_observed(operation, classify, |_, _, _| {})
    }

    /// Like [`run`](Self::run), calling `on_retry(attempt, error, delay)` before each backoff
    pub fn run_observed<T, E, F, C, R>(
        &self,
        mut operation: F,
        classify: C,
        mut on_retry: R,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Result<T, E>,
        C: Fn(&E) -> ErrorClass,
        R: FnMut(u32, &E, Duration),
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match operation(attempt) {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let attempts = attempt + 1;
                    if classify(&error) == ErrorClass::Fatal {
                        return Err(RetryError::Fatal { attempts, error });
                    }
                    if attempts >= max_attempts {
                        return Err(RetryError::Exhausted { attempts, error });
                    }

                    let delay = self.policy.delay_for(attempt);
                    debug!("Attempt {} failed, retrying in {:?}", attempts, delay);
                    on_retry(attempt, &error, delay);
                    self.sleeper.sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryCoordinator {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}
