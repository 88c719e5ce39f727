// src/core/retry.rs

//! Reconnect policies: given how many attempts have failed and why, decide how long
//! to wait before the next attempt, or stop reconnecting.

use crate::core::HubError;
use rand::Rng;
use std::time::Duration;

/// Everything a policy is told about the reconnect in progress.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Attempts that have already failed. Zero when the connection has just been lost.
    pub previous_retry_count: u64,
    /// Wall-clock time since reconnecting began.
    pub elapsed: Duration,
    /// The error that caused the last connection or attempt to fail.
    pub retry_reason: Option<HubError>,
}

/// Decides the delay before the next reconnect attempt. `None` stops reconnecting.
pub trait RetryPolicy: Send + Sync + 'static {
    fn next_retry_delay(&self, context: &RetryContext) -> Option<Duration>;
}

impl<F> RetryPolicy for F
where
    F: Fn(&RetryContext) -> Option<Duration> + Send + Sync + 'static,
{
    fn next_retry_delay(&self, context: &RetryContext) -> Option<Duration> {
        self(context)
    }
}

/// Waits through a fixed list of delays, then gives up.
#[derive(Debug, Clone)]
pub struct DefaultRetryPolicy {
    delays: Vec<Duration>,
}

impl DefaultRetryPolicy {
    /// 0s, 2s, 10s and 30s, then stop.
    pub const DEFAULT_DELAYS: [Duration; 4] = [
        Duration::from_secs(0),
        Duration::from_secs(2),
        Duration::from_secs(10),
        Duration::from_secs(30),
    ];

    pub fn new() -> Self {
        Self {
            delays: Self::DEFAULT_DELAYS.to_vec(),
        }
    }

    pub fn with_delays(delays: impl Into<Vec<Duration>>) -> Self {
        Self {
            delays: delays.into(),
        }
    }
}

impl Default for DefaultRetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn next_retry_delay(&self, context: &RetryContext) -> Option<Duration> {
        usize::try_from(context.previous_retry_count)
            .ok()
            .and_then(|index| self.delays.get(index).copied())
    }
}

/// The initial delay for the exponential backoff strategy.
pub const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// The maximum delay for the exponential backoff strategy.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
/// Upper bound of the random jitter added to every delay.
pub const DEFAULT_MAX_JITTER: Duration = Duration::from_millis(500);

/// Doubles the delay after every failed attempt up to a cap, adding random jitter so
/// a fleet of clients does not reconnect in lockstep after a server restart.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    max_jitter: Duration,
    max_attempts: Option<u64>,
}

impl ExponentialBackoffPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_jitter: DEFAULT_MAX_JITTER,
            max_attempts: None,
        }
    }

    pub fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Stop after this many attempts. Unlimited when unset.
    pub fn with_max_attempts(mut self, max_attempts: u64) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// The delay before jitter for the given attempt number.
    pub fn base_delay(&self, previous_retry_count: u64) -> Duration {
        let exponent = previous_retry_count.min(31) as u32;
        self.initial_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }
}

impl Default for ExponentialBackoffPolicy {
    fn default() -> Self {
        Self::new(INITIAL_RECONNECT_DELAY, MAX_RECONNECT_DELAY)
    }
}

impl RetryPolicy for ExponentialBackoffPolicy {
    fn next_retry_delay(&self, context: &RetryContext) -> Option<Duration> {
        if let Some(max) = self.max_attempts
            && context.previous_retry_count >= max
        {
            return None;
        }
        let base = self.base_delay(context.previous_retry_count);
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
        };
        Some(base + jitter)
    }
}
