//! Delay policy between job requests.
//!
//! Every failed request doubles the previous delay and adds the minimum
//! retry interval, capped at the maximum. In test mode the delay is fixed.

use gcomp_common::config::TimeoutConfig;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first request.
    pub first_delay: Duration,
    pub min_try: Duration,
    pub max_try: Duration,
    /// Fixed delay used instead of the backoff in test mode.
    pub test_mode_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TimeoutConfig::default(), false)
    }
}

impl RetryPolicy {
    pub fn from_config(timeouts: &TimeoutConfig, test_mode: bool) -> Self {
        Self {
            first_delay: Duration::from_millis(timeouts.now_try_ms),
            min_try: Duration::from_millis(timeouts.min_try_ms),
            max_try: Duration::from_millis(timeouts.max_try_ms),
            test_mode_delay: test_mode.then(|| Duration::from_millis(timeouts.test_mode_try_ms)),
        }
    }

    /// Delay to use after a failure that followed `previous`.
    pub fn next_delay(&self, previous: Duration) -> Duration {
        let delay = match self.test_mode_delay {
            Some(fixed) => fixed,
            None => previous.saturating_mul(2).saturating_add(self.min_try),
        };
        delay.min(self.max_try)
    }
}
