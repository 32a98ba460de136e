//! Jitter applied to reconnect delays.

use std::time::Duration;

use rand::Rng;

/// Randomization of retry delays.
///
/// - [`JitterPolicy::None`] exact delay
/// - [`JitterPolicy::Full`] random delay in `[0, delay]`
/// - [`JitterPolicy::Equal`] `delay/2 + random[0, delay/2]`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JitterPolicy {
    /// No jitter: use the exact backoff delay.
    #[default]
    None,
    /// Random delay in `[0, delay]`.
    Full,
    /// Half the delay plus a random share of the other half.
    Equal,
}

impl JitterPolicy {
    /// Scale `delay` by a random factor in `[0, 1]` (`Full`) or `[0.5, 1]` (`Equal`).
    pub fn apply(&self, delay: Duration) -> Duration {
        let floor = match self {
            JitterPolicy::None => return delay,
            JitterPolicy::Full => 0.0,
            JitterPolicy::Equal => 0.5,
        };
        delay.mul_f64(rand::rng().random_range(floor..=1.0))
    }
}
