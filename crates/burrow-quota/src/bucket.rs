//! Token bucket rate limiter

use std::sync::Mutex;
use std::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Continuous-refill token bucket
///
/// Tokens are a real value so sub-token refill accumulates between calls;
/// refill is lazy, computed on every observation. A bucket with capacity
/// zero or below permanently denies.
pub struct TokenBucket {
    capacity: i64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket starting full
    pub fn new(capacity: i64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: capacity.max(0) as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Consume one token if available
    pub fn allow(&self) -> bool {
        self.allow_n(1)
    }

    /// Consume `n` tokens if available, leaving the level untouched otherwise
    pub fn allow_n(&self, n: u32) -> bool {
        if self.capacity <= 0 {
            return false;
        }

        let mut state = self.state.lock().unwrap();
        Self::refill(&mut state, self.capacity, self.refill_rate);

        let need = n as f64;
        if state.tokens >= need {
            state.tokens -= need;
            true
        } else {
            false
        }
    }

    /// Current level after refill, plus the configured capacity
    pub fn stats(&self) -> (f64, i64) {
        let mut state = self.state.lock().unwrap();
        Self::refill(&mut state, self.capacity, self.refill_rate);
        (state.tokens, self.capacity)
    }

    fn refill(state: &mut BucketState, capacity: i64, refill_rate: f64) {
        let now = Instant::now();
        // saturating: a skewed clock reads as zero elapsed
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * refill_rate).min(capacity.max(0) as f64);
        state.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_bucket_starts_full() {
        let bucket = TokenBucket::new(3, 1.0);
        let (tokens, capacity) = bucket.stats();
        assert_eq!(capacity, 3);
        assert!(tokens >= 2.9);
    }

    #[test]
    fn test_bucket_drains_then_denies() {
        let bucket = TokenBucket::new(3, 1.0);

        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(!bucket.allow());
    }

    #[test]
    fn test_bucket_refills_over_time() {
        let bucket = TokenBucket::new(3, 1.0);
        for _ in 0..3 {
            assert!(bucket.allow());
        }
        assert!(!bucket.allow());

        std::thread::sleep(Duration::from_millis(1050));

        assert!(bucket.allow());
        assert!(!bucket.allow());
    }

    #[test]
    fn test_bucket_never_exceeds_capacity() {
        let bucket = TokenBucket::new(2, 1000.0);
        std::thread::sleep(Duration::from_millis(50));

        let (tokens, _) = bucket.stats();
        assert!(tokens <= 2.0);
    }

    #[test]
    fn test_allow_n() {
        let bucket = TokenBucket::new(5, 1.0);
        assert!(bucket.allow_n(4));
        assert!(!bucket.allow_n(2));
        assert!(bucket.allow_n(1));
    }

    #[test]
    fn test_failed_allow_leaves_level_unchanged() {
        let bucket = TokenBucket::new(3, 0.0);
        assert!(!bucket.allow_n(5));
        let (tokens, _) = bucket.stats();
        assert!((tokens - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_zero_capacity_always_denies() {
        let bucket = TokenBucket::new(0, 10.0);
        assert!(!bucket.allow());
        std::thread::sleep(Duration::from_millis(20));
        assert!(!bucket.allow());
    }
}
