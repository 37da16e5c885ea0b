//! # Token-Bucket Pacer
//!
//! Grounded in the original C transport's `TokenBucket`/`TokenBucketInit`/
//! `PutToken`/`GetToken` (`examples/original_source/common.h`, `Tx.c`):
//! a capacity that refills continuously at a configured byte rate and is
//! drawn down non-blockingly by each emission. `acquire` never blocks —
//! failure just means "no token this tick".

use quanta::Instant;

/// Maximum bucket capacity in bytes.
pub const MAX_CAPACITY: u64 = 4096;

pub struct TokenBucket {
    last_refill: Instant,
    capacity: u64,
    max_capacity: u64,
    /// Rate in bytes/ms.
    rate: f64,
}

impl TokenBucket {
    /// Create a bucket starting full, at the given rate (bytes/ms).
    pub fn new(rate_bytes_per_ms: f64) -> Self {
        TokenBucket {
            last_refill: Instant::now(),
            capacity: MAX_CAPACITY,
            max_capacity: MAX_CAPACITY,
            rate: rate_bytes_per_ms,
        }
    }

    /// Create a bucket with a non-default max capacity (useful for tests).
    pub fn with_max_capacity(rate_bytes_per_ms: f64, max_capacity: u64) -> Self {
        TokenBucket {
            last_refill: Instant::now(),
            capacity: max_capacity,
            max_capacity,
            rate: rate_bytes_per_ms,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed_ms = now.duration_since(self.last_refill).as_secs_f64() * 1000.0;
        let grant = (elapsed_ms * self.rate).floor() as i64;
        if grant > 0 {
            self.capacity = (self.capacity + grant as u64).min(self.max_capacity);
            self.last_refill = now;
        }
    }

    /// Attempt to withdraw `n` bytes worth of tokens. Non-blocking: returns
    /// `false` immediately if insufficient capacity, leaving the bucket
    /// untouched.
    pub fn acquire(&mut self, n: u64) -> bool {
        self.refill();
        if self.capacity >= n {
            self.capacity -= n;
            true
        } else {
            false
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn set_rate(&mut self, rate_bytes_per_ms: f64) {
        self.rate = rate_bytes_per_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn starts_full() {
        let bucket = TokenBucket::new(1.0);
        assert_eq!(bucket.capacity(), MAX_CAPACITY);
    }

    #[test]
    fn acquire_drains_capacity() {
        let mut bucket = TokenBucket::with_max_capacity(0.0, 1000);
        assert!(bucket.acquire(400));
        assert_eq!(bucket.capacity(), 600);
    }

    #[test]
    fn acquire_fails_when_insufficient() {
        let mut bucket = TokenBucket::with_max_capacity(0.0, 100);
        assert!(!bucket.acquire(200));
        assert_eq!(bucket.capacity(), 100, "failed acquire must not touch capacity");
    }

    #[test]
    fn refill_caps_at_max() {
        let mut bucket = TokenBucket::with_max_capacity(1_000_000.0, 1000);
        bucket.acquire(1000);
        sleep(Duration::from_millis(5));
        assert!(bucket.acquire(1000), "should have refilled to max well within 5ms at this rate");
    }

    #[test]
    fn refill_accrues_over_time() {
        let mut bucket = TokenBucket::with_max_capacity(100.0, 10_000);
        bucket.acquire(10_000); // drain fully
        assert_eq!(bucket.capacity(), 0);
        sleep(Duration::from_millis(20));
        assert!(bucket.acquire(100), "20ms at 100 bytes/ms should yield >=100 bytes");
    }
}
