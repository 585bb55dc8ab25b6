//! Minimum-interval gate shared by every identity lookup.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Callers arriving before `min_interval` has passed since the previous call
/// block until it has. The sleep happens under the lock, so concurrent callers
/// are serialized.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    /// Waits for the next free slot and claims it.
    pub fn acquire(&self) {
        let mut last_call = match self.last_call.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = *last_call {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                std::thread::sleep(self.min_interval - elapsed);
            }
        }
        *last_call = Some(Instant::now());
    }
}
