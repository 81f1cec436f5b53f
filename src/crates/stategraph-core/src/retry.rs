//! Retry policies for node execution
//!
//! A [`RetryPolicy`] decides how often a failing node is re-run inside the
//! same superstep and how long to wait between attempts. Retries are invisible
//! to the rest of the run: only the final outcome of a task is merged.
//!
//! # Exponential backoff
//!
//! ```text
//! delay = initial_interval × backoff_factor ^ attempt
//! delay = min(delay, max_interval)
//! if jitter: delay *= random(0.5..=1.5)
//! ```
//!
//! With the default settings (0.5s, factor 2.0) the waits are 0.5s, 1s, 2s, ...
//!
//! # Which errors are retried
//!
//! [`RetryOn`] selects the retryable error classes. The default,
//! [`RetryOn::Transient`], retries [`GraphError::Transient`], timeouts and I/O
//! errors and lets everything else fail fast. The suspend signal raised by
//! [`NodeContext::interrupt`](crate::NodeContext::interrupt) is never retried.
//!
//! ```rust
//! use stategraph_core::retry::{RetryOn, RetryPolicy};
//!
//! let policy = RetryPolicy::new(5)
//!     .with_initial_interval(1.0)
//!     .with_backoff_factor(3.0)
//!     .with_max_interval(60.0)
//!     .with_jitter(true)
//!     .with_retry_on(RetryOn::Any);
//!
//! assert!(policy.should_retry(4));
//! assert!(!policy.should_retry(5));
//! ```

use crate::error::{GraphError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Longest wait between two attempts, in seconds
pub const MAX_RETRY_INTERVAL: f64 = 86_400.0;

/// Predicate deciding whether an error is worth another attempt
pub type RetryPredicate = Arc<dyn Fn(&GraphError) -> bool + Send + Sync>;

/// Error classes a policy retries
#[derive(Clone, Default)]
pub enum RetryOn {
    /// Errors for which [`GraphError::is_transient`] holds
    #[default]
    Transient,
    /// Every failure
    Any,
    /// Custom classification
    Predicate(RetryPredicate),
}

impl RetryOn {
    /// Whether `error` belongs to the retryable classes
    pub fn matches(&self, error: &GraphError) -> bool {
        if error.is_interrupt() {
            return false;
        }
        match self {
            RetryOn::Transient => error.is_transient(),
            RetryOn::Any => true,
            RetryOn::Predicate(predicate) => predicate(error),
        }
    }
}

impl fmt::Debug for RetryOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryOn::Transient => f.write_str("Transient"),
            RetryOn::Any => f.write_str("Any"),
            RetryOn::Predicate(_) => f.write_str("Predicate(<function>)"),
        }
    }
}

/// Configuration for retrying failed node executions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: usize,

    /// Initial interval between retries in seconds
    pub initial_interval: f64,

    /// Multiplier for the interval after each retry
    pub backoff_factor: f64,

    /// Maximum interval between retries in seconds
    pub max_interval: f64,

    /// Whether to add random jitter to intervals
    pub jitter: bool,

    /// Error classes that are retried
    #[serde(skip)]
    pub retry_on: RetryOn,
}

impl RetryPolicy {
    /// Create a new retry policy with the given max attempts
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval: 0.5,
            backoff_factor: 2.0,
            max_interval: 128.0,
            jitter: true,
            retry_on: RetryOn::Transient,
        }
    }

    /// A single attempt, no retries
    pub fn none() -> Self {
        Self::new(1)
    }

    /// Set the initial interval between retries
    pub fn with_initial_interval(mut self, seconds: f64) -> Self {
        self.initial_interval = seconds;
        self
    }

    /// Set the backoff factor
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Set the maximum interval between retries
    pub fn with_max_interval(mut self, seconds: f64) -> Self {
        self.max_interval = seconds;
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Select the retryable error classes
    pub fn with_retry_on(mut self, retry_on: RetryOn) -> Self {
        self.retry_on = retry_on;
        self
    }

    /// Calculate the delay for a given attempt number (0-indexed)
    ///
    /// Uses exponential backoff: initial_interval * (backoff_factor ^ attempt)
    /// Capped at max_interval and [`MAX_RETRY_INTERVAL`], with optional jitter.
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        if attempt >= self.max_attempts {
            return Duration::from_secs(0);
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_delay = self.initial_interval * self.backoff_factor.powi(exponent);
        // f64::min ignores a NaN operand, so the result is always in range
        let capped_delay = base_delay
            .min(self.max_interval)
            .min(MAX_RETRY_INTERVAL)
            .max(0.0);

        let final_delay = if self.jitter {
            let mut rng = rand::thread_rng();
            capped_delay * rng.gen_range(0.5..=1.5)
        } else {
            capped_delay
        };

        Duration::try_from_secs_f64(final_delay).unwrap_or(Duration::ZERO)
    }

    /// Reject intervals that are negative, not finite or beyond [`MAX_RETRY_INTERVAL`]
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("initial_interval", self.initial_interval),
            ("backoff_factor", self.backoff_factor),
            ("max_interval", self.max_interval),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(GraphError::Configuration(format!(
                    "retry.{} must be a finite, non-negative number, got {}",
                    name, value
                )));
            }
        }
        if self.initial_interval > MAX_RETRY_INTERVAL || self.max_interval > MAX_RETRY_INTERVAL {
            return Err(GraphError::Configuration(format!(
                "retry intervals must not exceed {} seconds",
                MAX_RETRY_INTERVAL
            )));
        }
        if self.max_attempts == 0 {
            return Err(GraphError::Configuration("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Whether another attempt is allowed after `attempt` attempts
    pub fn should_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }

    /// Whether `error`, raised by attempt number `attempt`, earns another attempt
    pub fn allows_retry(&self, attempt: usize, error: &GraphError) -> bool {
        self.should_retry(attempt) && self.retry_on.matches(error)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}
