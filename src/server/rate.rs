//! Close-rate limiting.
//!
//! A pacing limiter in the style of leaky-bucket take(): each `acquire`
//! reserves the next slot on a fixed interval and sleeps until it comes up,
//! so connection teardown is spread evenly instead of bursting.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

pub(crate) struct RateLimiter {
    interval: Duration,
    next_at: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// A limiter allowing `per_second` acquisitions per second.
    pub(crate) fn new(per_second: u32) -> Self {
        debug_assert!(per_second > 0);
        Self {
            interval: Duration::from_secs(1) / per_second,
            next_at: Mutex::new(None),
        }
    }

    /// Take one slot, sleeping until it is due.
    pub(crate) async fn acquire(&self) {
        let wake = {
            let mut next_at = self.next_at.lock();
            let now = Instant::now();
            let at = match *next_at {
                Some(t) if t > now => t,
                _ => now,
            };
            *next_at = Some(at + self.interval);
            at
        };
        if wake > Instant::now() {
            tokio::time::sleep_until(wake).await;
        }
    }
}
