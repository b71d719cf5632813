use parking_lot::Mutex;
use tokio::time::Instant;

use crate::err::ProbeError;

/// Token bucket guarding the send path of a transport.
///
/// Sends that would exceed the bucket fail immediately with
/// [`ProbeError::RateLimited`] instead of blocking; a pinger keeping to
/// its minimum one second interval never hits the limit. The limit holds
/// in the privileged server regardless of what the client believes.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    per_second: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

impl RateLimiter {
    /// Burst size of the default limiter.
    pub const DEFAULT_BURST: u32 = 5;

    /// Sustained sends per second of the default limiter.
    pub const DEFAULT_PER_SECOND: f64 = 1.0;

    pub fn new(burst: u32, per_second: f64) -> RateLimiter {
        RateLimiter {
            capacity: f64::from(burst),
            per_second,
            state: Mutex::new(BucketState {
                tokens: f64::from(burst),
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Takes one token or fails without blocking.
    pub fn try_acquire(&self) -> Result<(), ProbeError> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.refilled_at);
        state.tokens =
            (state.tokens + elapsed.as_secs_f64() * self.per_second).min(self.capacity);
        state.refilled_at = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            Err(ProbeError::RateLimited)
        }
    }
}

impl Default for RateLimiter {
    fn default() -> RateLimiter {
        RateLimiter::new(RateLimiter::DEFAULT_BURST, RateLimiter::DEFAULT_PER_SECOND)
    }
}
