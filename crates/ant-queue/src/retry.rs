//! Retry policy and backoff computation

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::{Backoff, BackoffKind};

/// Process-wide retry strategy (env: APP_QUEUE_RETRY_STRATEGY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Failed jobs are never retried, whatever their attempt budget
    #[default]
    None,
    Fixed,
    Exponential,
}

impl FromStr for RetryStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(RetryStrategy::None),
            "fixed" => Ok(RetryStrategy::Fixed),
            "exponential" => Ok(RetryStrategy::Exponential),
            other => Err(format!("unknown retry strategy: {other}")),
        }
    }
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RetryStrategy::None => "none",
            RetryStrategy::Fixed => "fixed",
            RetryStrategy::Exponential => "exponential",
        })
    }
}

/// What to do with a job whose handler just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    Fail,
}

/// Decides retry eligibility and delay.
///
/// Retries are opt-in: with [`RetryStrategy::None`] the policy refuses every
/// retry, even for jobs that carry an attempt budget or their own backoff.
/// The stalled-job watchdog settings live here too because the watchdog only
/// runs when retries are enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    strategy: RetryStrategy,
    base_delay: Duration,
    stalled_interval: Duration,
    max_stalled_count: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

impl RetryPolicy {
    pub fn new(strategy: RetryStrategy, base_delay: Duration) -> Self {
        Self {
            strategy,
            base_delay,
            stalled_interval: Duration::from_millis(1000),
            max_stalled_count: 10,
        }
    }

    pub fn disabled() -> Self {
        Self::new(RetryStrategy::None, Duration::from_millis(1000))
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::new(RetryStrategy::Fixed, delay)
    }

    pub fn exponential(delay: Duration) -> Self {
        Self::new(RetryStrategy::Exponential, delay)
    }

    pub fn with_stalled_interval(mut self, interval: Duration) -> Self {
        self.stalled_interval = interval;
        self
    }

    pub fn with_max_stalled_count(mut self, count: u32) -> Self {
        self.max_stalled_count = count;
        self
    }

    pub fn strategy(&self) -> RetryStrategy {
        self.strategy
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn stalled_interval(&self) -> Duration {
        self.stalled_interval
    }

    pub fn max_stalled_count(&self) -> u32 {
        self.max_stalled_count
    }

    pub fn is_enabled(&self) -> bool {
        self.strategy != RetryStrategy::None
    }

    /// Backoff stamped on jobs that do not bring their own.
    pub fn default_backoff(&self) -> Option<Backoff> {
        match self.strategy {
            RetryStrategy::None => None,
            RetryStrategy::Fixed => Some(Backoff::fixed(self.base_delay)),
            RetryStrategy::Exponential => Some(Backoff::exponential(self.base_delay)),
        }
    }

    /// `attempt` is the number of attempts made so far, including the one that
    /// just failed.
    pub fn should_retry(&self, attempt: u32, max_attempts: u32) -> bool {
        self.is_enabled() && attempt < max_attempts
    }

    /// Delay before the retry that follows failed attempt number `attempt`
    /// (1-based). Exponential backoff doubles per attempt and saturates.
    pub fn next_delay(attempt: u32, backoff: &Backoff) -> Duration {
        match backoff.kind {
            BackoffKind::Fixed => backoff.delay,
            BackoffKind::Exponential => {
                let exponent = attempt.saturating_sub(1);
                let factor = 2u32.saturating_pow(exponent);
                backoff.delay.saturating_mul(factor)
            }
        }
    }

    pub fn decide(
        &self,
        attempt: u32,
        max_attempts: u32,
        backoff: Option<&Backoff>,
    ) -> RetryDecision {
        if !self.should_retry(attempt, max_attempts) {
            return RetryDecision::Fail;
        }
        let fallback = self.default_backoff();
        let delay = backoff
            .or(fallback.as_ref())
            .map_or(Duration::ZERO, |b| Self::next_delay(attempt, b));
        RetryDecision::Retry { delay }
    }
}
