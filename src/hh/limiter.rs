//! Token-bucket byte rate limiter for the send loop.

use std::time::{Duration, Instant};

/// Accumulates `rate` tokens per second up to `burst`; consuming more than
/// the accrued tokens yields a wait proportional to the deficit. Consumption
/// happens after a send, so the wait throttles the next one.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl RateLimiter {
    /// `rate` in bytes per second; the bucket starts full at `burst`.
    pub fn new(rate: u64, burst: u64) -> Self {
        Self {
            rate: rate as f64,
            burst: burst as f64,
            tokens: burst as f64,
            last: Instant::now(),
        }
    }

    /// Consumes `n` tokens at `now` and returns how long the caller must
    /// wait before the next operation.
    pub fn register(&mut self, n: u64, now: Instant) -> Duration {
        if self.rate <= 0.0 {
            return Duration::ZERO;
        }
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.tokens -= n as f64;
        if self.tokens >= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(-self.tokens / self.rate)
    }

    /// Blocks until `n` bytes worth of tokens have accrued.
    pub fn wait_n(&mut self, n: u64) {
        let wait = self.register(n, Instant::now());
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
    }
}
