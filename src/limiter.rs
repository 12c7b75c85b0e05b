//! A leaky-bucket rate limiter.
//!
//! The socket consults its limiters before each transfer; when a
//! submission would exceed the configured rate, the socket applies flow
//! control in that direction and schedules a relax timer at the
//! limiter's computed time-to-submit.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::proactor::RateLimiter;

struct BucketState {
    level: u64,
    last_drain: Instant,
}

/// Admits `rate` bytes per second with bursts of up to `capacity`
/// bytes.
pub struct LeakyBucket {
    rate: u64,
    capacity: u64,
    state: Mutex<BucketState>,
}

impl LeakyBucket {
    pub fn new(rate: u64, capacity: u64, now: Instant) -> Self {
        Self {
            rate: rate.max(1),
            capacity: capacity.max(1),
            state: Mutex::new(BucketState {
                level: 0,
                last_drain: now,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn drain(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_drain);
        let leaked = (elapsed.as_secs_f64() * self.rate as f64) as u64;
        if leaked > 0 {
            state.level = state.level.saturating_sub(leaked);
            state.last_drain = now;
        }
    }
}

impl RateLimiter for LeakyBucket {
    fn would_exceed_bandwidth(&self, now: Instant) -> bool {
        let mut state = self.lock();
        self.drain(&mut state, now);
        state.level >= self.capacity
    }

    fn calculate_time_to_submit(&self, now: Instant) -> Duration {
        let mut state = self.lock();
        self.drain(&mut state, now);
        if state.level < self.capacity {
            return Duration::from_secs(0);
        }
        let excess = state.level - self.capacity + 1;
        Duration::from_secs_f64(excess as f64 / self.rate as f64)
    }

    fn submit(&self, amount: usize) {
        let mut state = self.lock();
        state.level = state.level.saturating_add(amount as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_until_capacity() {
        let start = Instant::now();
        let bucket = LeakyBucket::new(1000, 4096, start);
        assert!(!bucket.would_exceed_bandwidth(start));

        bucket.submit(4096);
        assert!(bucket.would_exceed_bandwidth(start));
        assert!(bucket.calculate_time_to_submit(start) > Duration::from_secs(0));
    }

    #[test]
    fn drains_over_time() {
        let start = Instant::now();
        let bucket = LeakyBucket::new(1000, 1000, start);
        bucket.submit(2000);
        assert!(bucket.would_exceed_bandwidth(start));

        // After two seconds the 2000 submitted bytes have leaked out.
        let later = start + Duration::from_secs(2);
        assert!(!bucket.would_exceed_bandwidth(later));
        assert_eq!(
            bucket.calculate_time_to_submit(later),
            Duration::from_secs(0)
        );
    }
}
