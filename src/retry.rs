//! Backoff strategies for failed job attempts.
//!
//! When a handler fails and the job still has attempts left, the registry moves the
//! job to `retrying` and pushes its `scheduled_at` into the future by the delay this
//! strategy computes. Nothing ever sleeps; the job simply becomes ready again on a
//! later tick.
//!
//! - [`Fixed`](RetryStrategy::Fixed) - Constant delay between retries
//! - [`Linear`](RetryStrategy::Linear) - Linearly increasing delays
//! - [`Exponential`](RetryStrategy::Exponential) - Exponentially increasing delays with optional jitter
//! - [`Fibonacci`](RetryStrategy::Fibonacci) - Delays following the Fibonacci sequence
//!
//! # Examples
//!
//! ```rust
//! use batchwork::retry::{JitterType, RetryStrategy};
//! use std::time::Duration;
//!
//! let strategy = RetryStrategy::Exponential {
//!     base: Duration::from_secs(2),
//!     multiplier: 1.5,
//!     max_delay: Some(Duration::from_secs(5 * 60)),
//!     jitter: Some(JitterType::Multiplicative(0.1)),
//! };
//! let delay = strategy.calculate_delay(1);
//! assert!(delay >= Duration::from_millis(1800) && delay <= Duration::from_millis(2200));
//! ```

use crate::config::{duration_secs, option_duration_secs};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Types of jitter that can be applied to retry delays.
///
/// Jitter spreads retries of jobs that failed together so they do not all become
/// ready on the same tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum JitterType {
    /// `delay ± rand(0, amount)`
    Additive(#[serde(with = "duration_secs")] Duration),

    /// `delay * (1 ± rand(0, factor))`
    Multiplicative(f64),
}

impl JitterType {
    /// Apply jitter to a given delay. The result is never negative.
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rand::thread_rng();

        match self {
            JitterType::Additive(jitter_amount) => {
                let jitter_millis = rng.gen_range(0..=jitter_amount.as_millis() as u64);
                let jitter = Duration::from_millis(jitter_millis);

                if rng.gen_bool(0.5) {
                    delay + jitter
                } else {
                    delay.saturating_sub(jitter)
                }
            }
            JitterType::Multiplicative(factor) => {
                let factor = factor.abs().min(1.0);
                let jitter_factor = rng.gen_range((1.0 - factor)..=(1.0 + factor));
                let jittered_millis = (delay.as_millis() as f64 * jitter_factor) as u64;
                Duration::from_millis(jittered_millis)
            }
        }
    }
}

/// Strategy for determining the delay before a failed job becomes ready again.
///
/// `attempt` is the number of attempts made so far (1 after the first failure).
///
/// ```rust
/// use batchwork::retry::RetryStrategy;
/// use std::time::Duration;
///
/// // Linear backoff: 10s, 20s, 30s, capped at 25s
/// let linear = RetryStrategy::linear(
///     Duration::from_secs(0),
///     Duration::from_secs(10),
///     Some(Duration::from_secs(25)),
/// );
/// assert_eq!(linear.calculate_delay(1), Duration::from_secs(10));
/// assert_eq!(linear.calculate_delay(3), Duration::from_secs(25));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Fixed delay between all retry attempts.
    Fixed {
        #[serde(with = "duration_secs")]
        delay: Duration,
    },

    /// `base + attempt * increment`
    Linear {
        #[serde(with = "duration_secs")]
        base: Duration,
        #[serde(with = "duration_secs")]
        increment: Duration,
        #[serde(
            default,
            with = "option_duration_secs",
            skip_serializing_if = "Option::is_none"
        )]
        max_delay: Option<Duration>,
    },

    /// `base * multiplier ^ (attempt - 1)`
    Exponential {
        #[serde(with = "duration_secs")]
        base: Duration,
        multiplier: f64,
        #[serde(
            default,
            with = "option_duration_secs",
            skip_serializing_if = "Option::is_none"
        )]
        max_delay: Option<Duration>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        jitter: Option<JitterType>,
    },

    /// `base * fibonacci(attempt)`
    Fibonacci {
        #[serde(with = "duration_secs")]
        base: Duration,
        #[serde(
            default,
            with = "option_duration_secs",
            skip_serializing_if = "Option::is_none"
        )]
        max_delay: Option<Duration>,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::exponential(Duration::from_secs(60), 2.0, Some(Duration::from_secs(3600)))
    }
}

impl RetryStrategy {
    /// Calculate the delay before the next attempt. Never shorter than 1ms.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay = match self {
            RetryStrategy::Fixed { delay } => *delay,

            RetryStrategy::Linear {
                base,
                increment,
                max_delay,
            } => {
                let delay = *base + increment.saturating_mul(attempt);
                cap(delay, max_delay)
            }

            RetryStrategy::Exponential {
                base,
                multiplier,
                max_delay,
                jitter,
            } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let factor = multiplier.powi(exponent);
                let delay = if factor.is_finite() {
                    Duration::try_from_secs_f64(base.as_secs_f64() * factor)
                        .unwrap_or(Duration::MAX)
                } else {
                    Duration::MAX
                };

                let capped = cap(delay, max_delay);
                match jitter {
                    Some(jitter_type) => jitter_type.apply(capped),
                    None => capped,
                }
            }

            RetryStrategy::Fibonacci { base, max_delay } => {
                let fib = fibonacci(attempt).min(u32::MAX as u64) as u32;
                cap(base.saturating_mul(fib), max_delay)
            }
        };

        delay.max(Duration::from_millis(1))
    }

    pub fn fixed(delay: Duration) -> Self {
        RetryStrategy::Fixed { delay }
    }

    pub fn linear(base: Duration, increment: Duration, max_delay: Option<Duration>) -> Self {
        RetryStrategy::Linear {
            base,
            increment,
            max_delay,
        }
    }

    pub fn exponential(base: Duration, multiplier: f64, max_delay: Option<Duration>) -> Self {
        RetryStrategy::Exponential {
            base,
            multiplier,
            max_delay,
            jitter: None,
        }
    }

    pub fn exponential_with_jitter(
        base: Duration,
        multiplier: f64,
        max_delay: Option<Duration>,
        jitter: JitterType,
    ) -> Self {
        RetryStrategy::Exponential {
            base,
            multiplier,
            max_delay,
            jitter: Some(jitter),
        }
    }

    pub fn fibonacci(base: Duration, max_delay: Option<Duration>) -> Self {
        RetryStrategy::Fibonacci { base, max_delay }
    }
}

fn cap(delay: Duration, max_delay: &Option<Duration>) -> Duration {
    match max_delay {
        Some(max) => delay.min(*max),
        None => delay,
    }
}

/// The n-th Fibonacci number with `fibonacci(0) == 0` and `fibonacci(1) == 1`.
pub fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}
