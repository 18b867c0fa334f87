//! Retry and backoff policy
//!
//! A stateless policy consulted by every transport operation. It classifies
//! failures, decides whether another attempt is allowed and how long to wait
//! before it.

use crate::config::{JitterMode, TransferConfig};
use crate::error::ReasonCode;
use rand::Rng;
use std::time::Duration;

/// Retry-relevant classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection reset, timeout
    NetworkTransient,
    /// Explicit "too many requests", with an optional server wait hint
    RateLimited {
        /// Server-provided wait hint
        retry_after: Option<Duration>,
    },
    /// 5xx from the remote
    ServerTransient,
    /// Everything else
    Terminal,
}

impl ErrorClass {
    /// Whether the class is eligible for retry at all
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Terminal)
    }

    fn reason(&self) -> ReasonCode {
        match self {
            Self::NetworkTransient => ReasonCode::NetworkTransient,
            Self::RateLimited { .. } => ReasonCode::RateLimited,
            Self::ServerTransient => ReasonCode::ServerTransient,
            Self::Terminal => ReasonCode::Terminal,
        }
    }
}

/// Outcome of consulting the policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    /// Whether another attempt should be made
    pub retryable: bool,
    /// How long to wait before that attempt
    pub wait: Duration,
    /// Why
    pub reason: ReasonCode,
}

impl RetryDecision {
    fn retry(wait: Duration, reason: ReasonCode) -> Self {
        Self {
            retryable: true,
            wait,
            reason,
        }
    }

    fn give_up(reason: ReasonCode) -> Self {
        Self {
            retryable: false,
            wait: Duration::ZERO,
            reason,
        }
    }
}

/// Exponential backoff with jitter and a bounded attempt count
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Cap on the computed delay
    pub max_delay: Duration,
    /// Jitter distribution
    pub jitter: JitterMode,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TransferConfig::default())
    }
}

impl RetryPolicy {
    /// Build from the transfer configuration
    pub fn from_config(config: &TransferConfig) -> Self {
        Self {
            max_retries: config.max_retry_attempts,
            base_delay: config.base_backoff,
            max_delay: config.max_backoff,
            jitter: config.jitter,
        }
    }

    /// Policy that never waits, for tests and dry runs
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: JitterMode::None,
        }
    }

    /// Decide what to do after the `attempt`-th failure (1-based)
    pub fn decide(&self, attempt: u32, class: &ErrorClass) -> RetryDecision {
        if !class.is_retryable() {
            return RetryDecision::give_up(ReasonCode::Terminal);
        }
        if attempt > self.max_retries {
            return RetryDecision::give_up(ReasonCode::AttemptsExhausted);
        }

        let mut wait = self.jittered(self.backoff(attempt));
        if let ErrorClass::RateLimited {
            retry_after: Some(hint),
        } = class
        {
            wait = wait.max(*hint);
        }

        RetryDecision::retry(wait, class.reason())
    }

    /// Un-jittered delay for the given attempt: `base * 2^(attempt-1)`, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if delay.is_zero() {
            return delay;
        }
        let mut rng = rand::thread_rng();
        match self.jitter {
            JitterMode::None => delay,
            JitterMode::Full => delay.mul_f64(rng.gen_range(0.0..=1.0)),
            JitterMode::Equal => {
                let half = delay / 2;
                half + half.mul_f64(rng.gen_range(0.0..=1.0))
            }
        }
    }
}
