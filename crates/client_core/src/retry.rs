use std::time::Duration;

pub const HEALTHCHECK_INTERVAL: Duration = Duration::from_millis(5000);
pub const CREATION_BASE_DELAY: Duration = Duration::from_millis(1000);
pub const CREATION_MAX_DELAY: Duration = Duration::from_secs(30);
pub const CREATION_MAX_ATTEMPTS: u32 = 10;
/// Consecutive health check failures before the user is told the server looks down.
pub const HEALTHCHECK_ADVISORY_THRESHOLD: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    Exponential { factor: u32, max_delay: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub backoff: Backoff,
    /// Total attempts including the first one. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            backoff: Backoff::Fixed,
            max_attempts: None,
        }
    }

    pub fn exponential(base_delay: Duration, factor: u32, max_delay: Duration) -> Self {
        Self {
            base_delay,
            backoff: Backoff::Exponential { factor, max_delay },
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn healthcheck() -> Self {
        Self::fixed(HEALTHCHECK_INTERVAL)
    }

    pub fn creation() -> Self {
        Self::exponential(CREATION_BASE_DELAY, 2, CREATION_MAX_DELAY)
            .with_max_attempts(Some(CREATION_MAX_ATTEMPTS))
    }

    /// Whether another attempt may follow `failures` failed ones.
    pub fn allows_retry(&self, failures: u32) -> bool {
        self.max_attempts.map_or(true, |max| failures < max)
    }

    /// Wait before the attempt that follows the `failures`-th failure.
    pub fn delay_for(&self, failures: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential { factor, max_delay } => {
                let exponent = failures.saturating_sub(1);
                let multiplier = factor.max(1).saturating_pow(exponent);
                self.base_delay.saturating_mul(multiplier).min(max_delay)
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/retry_tests.rs"]
mod tests;
