//! Token bucket gating batch submission.

use parking_lot::Mutex;
use tokio::time::{Duration, Instant};

use crate::config::RateLimitConfig;
use crate::error::{GateError, Result};

/// Continuous-refill token bucket.
///
/// Holds at most `tokens`; refills `tokens` per `window`, linearly. Runs on
/// the Tokio clock so paused-time tests can step through windows.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    rate_per_sec: f64,
    state: Mutex<(f64, Instant)>,
}

impl TokenBucket {
    /// Full bucket
    pub fn new(config: &RateLimitConfig) -> Self {
        let capacity = f64::from(config.tokens.max(1));
        let window = config.window().max(Duration::from_millis(1));
        Self {
            capacity,
            rate_per_sec: capacity / window.as_secs_f64(),
            state: Mutex::new((capacity, Instant::now())),
        }
    }

    /// Take one token, or fail with `RateLimited` and the wait until one is due
    pub fn try_acquire(&self) -> Result<()> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let (tokens, last) = &mut *state;

        let elapsed = now.saturating_duration_since(*last).as_secs_f64();
        *tokens = (*tokens + elapsed * self.rate_per_sec).min(self.capacity);
        *last = now;

        if *tokens < 1.0 {
            let retry_after = Duration::from_secs_f64((1.0 - *tokens) / self.rate_per_sec);
            return Err(GateError::RateLimited {
                retry_after: retry_after.max(Duration::from_millis(1)),
            });
        }

        *tokens -= 1.0;
        Ok(())
    }

    /// Tokens currently available, rounded down
    pub fn available(&self) -> u32 {
        let state = self.state.lock();
        let elapsed = Instant::now()
            .saturating_duration_since(state.1)
            .as_secs_f64();
        (state.0 + elapsed * self.rate_per_sec).min(self.capacity).floor() as u32
    }

    /// Bucket capacity
    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }
}
