//! Delay schedules used by the long-running HTTP client and the render poller

use crate::config::PollConfig;
use std::time::Duration;

/// Used only when an empty schedule slips past validation
const FALLBACK_CONCURRENCY_DELAY: Duration = Duration::from_secs(2);

/// Delays for successive 503 responses to one logical request.
///
/// Walks the configured schedule and then repeats its last value forever,
/// so the iterator never ends.
#[derive(Debug, Clone)]
pub struct ConcurrencyBackoff {
    schedule: Vec<Duration>,
    index: usize,
}

impl ConcurrencyBackoff {
    pub fn new(schedule: Vec<Duration>) -> Self {
        Self { schedule, index: 0 }
    }

    /// Number of 503s seen so far
    pub fn attempts(&self) -> usize {
        self.index
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self
            .schedule
            .get(self.index)
            .or_else(|| self.schedule.last())
            .copied()
            .unwrap_or(FALLBACK_CONCURRENCY_DELAY);
        self.index += 1;
        delay
    }
}

impl Iterator for ConcurrencyBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_delay())
    }
}

/// Growing poll delay: `initial`, then multiplied by `factor` per poll, capped at `max`
#[derive(Debug, Clone)]
pub struct PollDelay {
    current: Duration,
    factor: f64,
    max: Duration,
}

impl PollDelay {
    pub fn new(initial: Duration, factor: f64, max: Duration) -> Self {
        Self {
            current: initial.min(max),
            factor: factor.max(1.0),
            max,
        }
    }

    /// Delay to wait now; advances the schedule
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.mul_f64(self.factor).min(self.max);
        delay
    }

    pub fn peek(&self) -> Duration {
        self.current
    }
}

impl From<&PollConfig> for PollDelay {
    fn from(config: &PollConfig) -> Self {
        Self::new(config.initial_delay.into(), config.factor, config.max_delay.into())
    }
}

/// Bounded fixed-delay retry budget for connection-level failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// Whether another attempt is allowed after `attempts` failures
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts <= self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}
