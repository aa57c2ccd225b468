//! Retry policy for a node's exec phase.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the wait between attempts grows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum Backoff {
    /// Wait the base delay before every retry
    #[default]
    Fixed,
    /// Wait `delay * multiplier^(retry - 1)`, capped at `max_delay`
    Exponential { multiplier: f64, max_delay: Duration },
}

/// Bounded retry configuration for `exec`.
///
/// `max_attempts` counts the first try, so `max_attempts = 3` means one call
/// and up to two retries. Zero is treated as one.
///
/// ```rust
/// use pocketgraph::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::attempts(4)
///     .with_delay(Duration::from_millis(125))
///     .with_exponential_backoff(2.0, Duration::from_millis(400));
///
/// assert_eq!(policy.delay_for_retry(1), Some(Duration::from_millis(125)));
/// assert_eq!(policy.delay_for_retry(2), Some(Duration::from_millis(250)));
/// assert_eq!(policy.delay_for_retry(3), Some(Duration::from_millis(400)));
/// assert_eq!(policy.delay_for_retry(4), None);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// A single attempt, no waiting
    pub const NONE: Self = Self {
        max_attempts: 1,
        delay: Duration::ZERO,
        backoff: Backoff::Fixed,
    };

    /// Up to `max_attempts` attempts with no delay in between
    pub const fn attempts(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            delay: Duration::ZERO,
            backoff: Backoff::Fixed,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_exponential_backoff(mut self, multiplier: f64, max_delay: Duration) -> Self {
        self.backoff = Backoff::Exponential {
            multiplier,
            max_delay,
        };
        self
    }

    /// Effective attempt budget (never below one)
    pub fn max_attempts(&self) -> usize {
        self.max_attempts.max(1)
    }

    /// Delay before retry number `retry` (1-based), or `None` once the budget
    /// is spent.
    pub fn delay_for_retry(&self, retry: usize) -> Option<Duration> {
        if retry == 0 || retry >= self.max_attempts() {
            return None;
        }

        match self.backoff {
            Backoff::Fixed => Some(self.delay),
            Backoff::Exponential {
                multiplier,
                max_delay,
            } => {
                let exponent = (retry - 1) as i32;
                let secs = self.delay.as_secs_f64() * multiplier.powi(exponent);
                if !secs.is_finite() || secs >= max_delay.as_secs_f64() {
                    Some(max_delay)
                } else {
                    Some(Duration::from_secs_f64(secs.max(0.0)))
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::NONE
    }
}

impl From<usize> for RetryPolicy {
    fn from(max_attempts: usize) -> Self {
        Self::attempts(max_attempts)
    }
}
