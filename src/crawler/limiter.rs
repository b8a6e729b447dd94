//! Process-wide request spacing
//!
//! One limiter is shared by every worker of an engine. Each `acquire` reserves
//! the next free start slot under a short lock, then sleeps outside the lock
//! until that slot arrives. Slots are handed out in lock order and are always
//! at least `min_wait` apart, so concurrent callers neither overlap nor starve.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

pub struct RateLimiter {
    min_wait: Duration,
    next_allowed: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_wait: Duration) -> Self {
        Self {
            min_wait,
            next_allowed: Mutex::new(None),
        }
    }

    pub fn min_wait(&self) -> Duration {
        self.min_wait
    }

    /// Waits until this caller may start a request and returns the granted start time
    pub async fn acquire(&self) -> Instant {
        let slot = {
            let mut next = self.next_allowed.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(at) if at > now => at,
                _ => now,
            };
            *next = Some(slot + self.min_wait);
            slot
        };

        if slot > Instant::now() {
            tracing::trace!("Rate limiter holding request for {:?}", slot - Instant::now());
            sleep_until(slot).await;
        }
        slot
    }
}
