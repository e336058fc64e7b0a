//! Reconnect delay schedule
//!
//! Linear growth with a ceiling: `delay(n) = min(base * n, ceiling)`. Clean
//! failures (refused login, handshake timeout) back off on `CLEAN`; errors
//! thrown mid-attempt use the slower `EXCEPTIONAL` schedule.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub ceiling: Duration,
}

impl BackoffPolicy {
    pub const CLEAN: BackoffPolicy = BackoffPolicy {
        base: Duration::from_secs(10),
        ceiling: Duration::from_secs(60),
    };

    pub const EXCEPTIONAL: BackoffPolicy = BackoffPolicy {
        base: Duration::from_secs(15),
        ceiling: Duration::from_secs(120),
    };

    pub fn delay(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(attempt).min(self.ceiling)
    }
}

/// Attempts since the last successful connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_delay: Option<Duration>,
}

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

impl RetryBudget {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            next_delay: None,
        }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next_delay = None;
    }

    pub fn exhausted(&self) -> bool {
        self.attempts > self.max_attempts
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}
