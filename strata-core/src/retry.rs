//! Retry policies.
//!
//! The entry state machine only ever asks one question after a failed
//! attempt: "retry, and after how long?". Everything else lives behind
//! [`RetryPolicy`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::FetchError;

/// Decides whether a failed execution gets another attempt.
pub trait RetryPolicy: Send + Sync + fmt::Debug {
    /// `failure_count` counts failures of the current execution, including
    /// `error` (so it is 1 after the first failure). `None` means give up.
    fn next_delay(&self, failure_count: u32, error: &FetchError) -> Option<Duration>;
}

/// Backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDelay {
    Fixed(Duration),
    Exponential(ExponentialBackoff),
}

impl RetryDelay {
    /// Delay before retry number `retry` (1-based).
    pub fn for_retry(&self, retry: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential(backoff) => backoff.for_retry(retry),
        }
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self::Exponential(ExponentialBackoff::default())
    }
}

/// `min(initial * multiplier^(retry - 1), max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2,
        }
    }
}

impl ExponentialBackoff {
    pub fn for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        let factor = self.multiplier.checked_pow(exponent).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }
}

/// The `retry` field of a configuration layer.
#[derive(Clone)]
pub enum Retry {
    /// `true` retries forever, `false` never retries.
    Enabled(bool),
    /// Retry at most this many times (so up to `n + 1` attempts).
    Count(u32),
    /// Fully custom policy; any `retry_delay` setting is ignored.
    Policy(Arc<dyn RetryPolicy>),
}

impl Retry {
    pub const DEFAULT_COUNT: u32 = 3;

    pub fn policy(policy: impl RetryPolicy + 'static) -> Self {
        Self::Policy(Arc::new(policy))
    }

    /// Combine with a backoff into the policy the state machine consults.
    pub fn into_policy(self, delay: RetryDelay) -> Arc<dyn RetryPolicy> {
        match self {
            Self::Enabled(true) => Arc::new(StandardRetry::forever(delay)),
            Self::Enabled(false) => Arc::new(StandardRetry::never()),
            Self::Count(n) => Arc::new(StandardRetry::times(n, delay)),
            Self::Policy(policy) => policy,
        }
    }
}

impl Default for Retry {
    fn default() -> Self {
        Self::Count(Self::DEFAULT_COUNT)
    }
}

impl PartialEq for Retry {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Enabled(a), Self::Enabled(b)) => a == b,
            (Self::Count(a), Self::Count(b)) => a == b,
            (Self::Policy(a), Self::Policy(b)) => {
                std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
            }
            _ => false,
        }
    }
}

impl fmt::Debug for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enabled(b) => f.debug_tuple("Enabled").field(b).finish(),
            Self::Count(n) => f.debug_tuple("Count").field(n).finish(),
            Self::Policy(p) => f.debug_tuple("Policy").field(p).finish(),
        }
    }
}

impl From<bool> for Retry {
    fn from(value: bool) -> Self {
        Self::Enabled(value)
    }
}

impl From<u32> for Retry {
    fn from(value: u32) -> Self {
        Self::Count(value)
    }
}

/// Limit-plus-backoff policy used for `Retry::Enabled` and `Retry::Count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandardRetry {
    /// `None` means unlimited.
    pub max_retries: Option<u32>,
    pub delay: RetryDelay,
}

impl StandardRetry {
    pub fn never() -> Self {
        Self {
            max_retries: Some(0),
            delay: RetryDelay::Fixed(Duration::ZERO),
        }
    }

    pub fn times(max_retries: u32, delay: RetryDelay) -> Self {
        Self {
            max_retries: Some(max_retries),
            delay,
        }
    }

    pub fn forever(delay: RetryDelay) -> Self {
        Self {
            max_retries: None,
            delay,
        }
    }
}

impl RetryPolicy for StandardRetry {
    fn next_delay(&self, failure_count: u32, _error: &FetchError) -> Option<Duration> {
        match self.max_retries {
            Some(max) if failure_count > max => None,
            _ => Some(self.delay.for_retry(failure_count)),
        }
    }
}
