//! Retry profile: how many retries and how long to wait before each.

use std::time::Duration;
use wh_config::{BackoffKind, RetrySettings};

/// Delay before retry `n` (1-based)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    /// Explicit delay per retry; the last entry repeats past the end
    Fixed(Vec<Duration>),
    /// `step * n`
    Linear(Duration),
    /// `base * 2^(n-1)`, capped at `max`
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    pub fn delay_for(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        match self {
            Backoff::Fixed(delays) => delays
                .get(retry as usize - 1)
                .or_else(|| delays.last())
                .copied()
                .unwrap_or(Duration::ZERO),
            Backoff::Linear(step) => step.saturating_mul(retry),
            Backoff::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(retry - 1);
                base.saturating_mul(factor).min(*max)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// 3 retries waiting 1s, 2s, 3s
    pub fn linear() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::Linear(Duration::from_secs(1)),
        }
    }

    /// Staged profile: immediate attempt, then after 1 minute, then after 4 minutes
    pub fn staged() -> Self {
        Self {
            max_retries: 2,
            backoff: Backoff::Fixed(vec![Duration::from_secs(60), Duration::from_secs(240)]),
        }
    }

    pub fn exponential(max_retries: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Exponential { base, max },
        }
    }

    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Backoff::Fixed(Vec::new()),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before the next attempt, or `None` once retries are exhausted.
    ///
    /// `attempt` is the zero-based attempt that just failed.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        let retry = attempt + 1;
        if retry > self.max_retries {
            return None;
        }
        Some(self.backoff.delay_for(retry))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear()
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        let backoff = match settings.backoff {
            BackoffKind::Linear => Backoff::Linear(Duration::from_millis(settings.base_delay_ms)),
            BackoffKind::Fixed => Backoff::Fixed(
                settings
                    .delays_ms
                    .iter()
                    .map(|ms| Duration::from_millis(*ms))
                    .collect(),
            ),
            BackoffKind::Exponential => Backoff::Exponential {
                base: Duration::from_millis(settings.base_delay_ms),
                max: Duration::from_millis(settings.max_delay_ms),
            },
        };

        Self {
            max_retries: settings.max_retries,
            backoff,
        }
    }
}
