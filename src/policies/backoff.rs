//! # Backoff policy for reconnect attempts.
//!
//! Reconnects normally wait a constant interval. A `factor` above `1.0` turns that into
//! `first × factor^n` for attempt `n`, capped at `max`. Jitter is applied last.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use resilient_broker::{BackoffPolicy, JitterPolicy};
//!
//! let backoff = BackoffPolicy {
//!     first: Duration::from_secs(1),
//!     max: Duration::from_secs(20),
//!     factor: 2.0,
//!     jitter: JitterPolicy::None,
//! };
//!
//! assert_eq!(backoff.next(0), Duration::from_secs(1));
//! assert_eq!(backoff.next(3), Duration::from_secs(8));
//! assert_eq!(backoff.next(10), Duration::from_secs(20));
//! ```

use std::time::Duration;

use crate::policies::JitterPolicy;

/// Reconnect backoff policy.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first attempt.
    pub first: Duration,
    /// Maximum delay cap.
    pub max: Duration,
    /// Multiplicative growth factor (`1.0` = constant interval).
    pub factor: f64,
    /// Jitter applied to every delay.
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    /// Constant 15s interval without jitter.
    fn default() -> Self {
        Self::constant(Duration::from_secs(15))
    }
}

impl BackoffPolicy {
    /// Fixed interval between attempts.
    pub fn constant(interval: Duration) -> Self {
        Self {
            first: interval,
            max: interval,
            factor: 1.0,
            jitter: JitterPolicy::None,
        }
    }

    /// Delay before redial number `attempt` (0-indexed).
    ///
    /// With the default `factor` of `1.0` this is always `first`, capped at `max`.
    pub fn next(&self, attempt: u32) -> Duration {
        let base = if self.factor <= 1.0 {
            self.first
        } else {
            // Past 2^64 the cap has long been reached.
            let grown = self.first.as_secs_f64() * self.factor.powi(attempt.min(64) as i32);
            Duration::try_from_secs_f64(grown).unwrap_or(self.max)
        };
        self.jitter.apply(base.min(self.max))
    }
}
