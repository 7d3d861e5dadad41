//! Backoff policy for failed pulls.
//!
//! Consecutive failures are counted; once the count reaches `max_retries` the
//! delay doubles (capped at `max_delay`) and the count starts over. Any
//! success restores the initial delay.

use std::time::Duration;

use crate::config::SyncOptions;

#[derive(Debug, Clone)]
pub struct RetryState {
    failures: u32,
    delay: Duration,
    base_delay: Duration,
    max_retries: u32,
    max_delay: Duration,
}

impl RetryState {
    pub fn new(base_delay: Duration, max_retries: u32, max_delay: Duration) -> Self {
        Self {
            failures: 0,
            delay: base_delay,
            base_delay,
            max_retries: max_retries.max(1),
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn from_options(options: &SyncOptions) -> Self {
        Self::new(
            Duration::from_secs(options.retry_delay_secs),
            options.max_retries,
            Duration::from_secs(options.max_retry_delay_secs),
        )
    }

    /// Count a failure. Returns `true` when this failure escalated the delay.
    pub fn record_failure(&mut self) -> bool {
        self.failures += 1;
        if self.failures < self.max_retries {
            return false;
        }
        self.delay = (self.delay * 2).min(self.max_delay);
        self.failures = 0;
        true
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.delay = self.base_delay;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn is_backing_off(&self) -> bool {
        self.failures > 0 || self.delay > self.base_delay
    }

    /// Minimum time between pull attempts: the poll interval, stretched to
    /// the backoff delay after failures.
    pub fn pull_wait(&self, interval: Duration) -> Duration {
        if self.is_backing_off() {
            interval.max(self.delay)
        } else {
            interval
        }
    }
}
