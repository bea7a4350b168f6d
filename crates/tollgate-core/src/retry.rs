use chrono::{DateTime, Utc};
use std::time::Duration;
use tollgate_protocol::ReasonCode;

use crate::config::RetryConfig;

/// Bounded exponential backoff without jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base: Duration,
    max: Duration,
}

/// What to do with an entity after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Park until `next_attempt_at`; `retry_count` is the new count.
    Retry {
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
        delay: Duration,
    },
    /// Transient failure with no retries left.
    Exhausted { retry_count: u32 },
    /// Not retryable; fail with this reason.
    Terminal(ReasonCode),
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(cfg.base_delay_ms),
            Duration::from_millis(cfg.max_delay_ms),
        )
    }

    /// Delay before the retry that follows `retry_count` earlier retries:
    /// `min(base * 2^retry_count, max)`, floored by `retry_after`.
    pub fn delay(&self, retry_count: u32, retry_after: Option<Duration>) -> Duration {
        let factor = 1u32.checked_shl(retry_count.min(31)).unwrap_or(u32::MAX);
        let backoff = self.base.saturating_mul(factor).min(self.max);
        match retry_after {
            Some(floor) => backoff.max(floor),
            None => backoff,
        }
    }

    pub fn decide(
        &self,
        reason: ReasonCode,
        retry_count: u32,
        max_retries: u32,
        retry_after: Option<Duration>,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if !reason.is_retryable() {
            return RetryDecision::Terminal(reason);
        }
        if retry_count >= max_retries {
            return RetryDecision::Exhausted { retry_count };
        }
        let delay = self.delay(retry_count, retry_after);
        let step = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        RetryDecision::Retry {
            retry_count: retry_count + 1,
            next_attempt_at: now.checked_add_signed(step).unwrap_or(DateTime::<Utc>::MAX_UTC),
            delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
