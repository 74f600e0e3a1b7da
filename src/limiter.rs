use std::time::Duration;

use tokio::time::Instant;

use crate::error::{BenchError, Result};

/// Default instantaneous permit capacity of a bucket.
pub const DEFAULT_BURST: u32 = 100;

// Absorbs float drift so a caller that sleeps exactly `delay` is granted on wake.
const EPSILON: f64 = 1e-9;

/// Outcome of a single [`TokenBucket::reserve`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    /// A permit was consumed and the caller may send now.
    pub granted: bool,
    /// Time until the next permit becomes available.
    pub delay: Duration,
}

/// Token bucket rate limiter.
///
/// Tokens refill continuously at `rate` per second up to `burst`. The bucket
/// starts full. `reserve` never blocks: callers sleep for the returned delay
/// themselves, which leaves room for a cancellation check between the
/// reservation and the sleep.
///
/// Over any window of length `T`, at most `rate * T + burst` permits are
/// granted.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(rate: f64, burst: u32, now: Instant) -> Result<Self> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(BenchError::Configuration(format!(
                "rate must be a positive number of messages per second, got {rate}"
            )));
        }
        if burst == 0 {
            return Err(BenchError::Configuration(
                "burst must be at least one permit".to_string(),
            ));
        }

        let burst = f64::from(burst);
        Ok(Self {
            rate,
            burst,
            tokens: burst,
            last: now,
        })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> u32 {
        self.burst as u32
    }

    /// Try to take one permit at `now`.
    pub fn reserve(&mut self, now: Instant) -> Reservation {
        self.refill(now);

        if self.tokens + EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            let delay = if self.tokens + EPSILON >= 1.0 {
                Duration::ZERO
            } else {
                self.time_to_next_permit()
            };
            return Reservation {
                granted: true,
                delay,
            };
        }

        Reservation {
            granted: false,
            delay: self.time_to_next_permit(),
        }
    }

    fn refill(&mut self, now: Instant) {
        // Calls with a stale `now` never move the clock backwards.
        if now <= self.last {
            return;
        }
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last = now;
    }

    fn time_to_next_permit(&self) -> Duration {
        let missing = (1.0 - self.tokens).max(0.0);
        let nanos = (missing / self.rate * 1e9).ceil();
        Duration::from_nanos(nanos as u64)
    }
}
