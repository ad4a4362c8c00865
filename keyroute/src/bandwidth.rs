//! Per-node token bucket limiting outgoing bytes.

use crate::time::{Duration, Timestamp};

/// Token bucket counting bytes. Tokens accrue lazily on query.
///
/// `remove` may drive the balance negative: an over-spend is paid back by
/// later refill before anything else can be sent.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Bytes per second, `None` for an unlimited link.
    rate: Option<u32>,
    size: f64,
    tokens: f64,
    last_update: Timestamp,
}

impl TokenBucket {
    /// Full bucket of `size` bytes refilled at `rate` bytes per second.
    pub fn new(rate: u32, size: u32, now: Timestamp) -> Self {
        Self {
            rate: Some(rate),
            size: size as f64,
            tokens: size as f64,
            last_update: now,
        }
    }

    /// Bucket that never limits.
    pub fn unlimited() -> Self {
        Self {
            rate: None,
            size: f64::INFINITY,
            tokens: f64::INFINITY,
            last_update: Timestamp::ZERO,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate.is_none()
    }

    fn refill(&mut self, now: Timestamp) {
        let Some(rate) = self.rate else {
            return;
        };
        let elapsed = now.saturating_sub(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate as f64).min(self.size);
        self.last_update = self.last_update.max(now);
    }

    /// Whole bytes that may be sent now.
    pub fn available(&mut self, now: Timestamp) -> i64 {
        self.refill(now);
        if self.tokens.is_infinite() {
            i64::MAX
        } else {
            self.tokens.floor() as i64
        }
    }

    pub fn remove(&mut self, bytes: usize, now: Timestamp) {
        self.refill(now);
        if self.rate.is_some() {
            self.tokens -= bytes as f64;
        }
    }

    /// Time until `bytes` tokens are available, `None` if the bucket can never hold them.
    pub fn time_until(&mut self, bytes: usize, now: Timestamp) -> Option<Duration> {
        self.refill(now);
        let Some(rate) = self.rate else {
            return Some(Duration::ZERO);
        };
        let needed = bytes as f64;
        if needed > self.size || rate == 0 {
            return None;
        }
        let missing = needed - self.tokens;
        if missing <= 0.0 {
            return Some(Duration::ZERO);
        }
        Some(Duration::from_secs_f64(missing / rate as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refill_capped_at_size() {
        let mut bucket = TokenBucket::new(1000, 5000, Timestamp::ZERO);
        assert_eq!(bucket.available(Timestamp::ZERO), 5000);

        bucket.remove(4000, Timestamp::ZERO);
        assert_eq!(bucket.available(Timestamp::ZERO), 1000);

        // 2 seconds at 1000 B/s
        assert_eq!(bucket.available(Timestamp::from_secs(2)), 3000);
        // Capped
        assert_eq!(bucket.available(Timestamp::from_secs(60)), 5000);
    }

    #[test]
    fn test_overspend_goes_negative() {
        let mut bucket = TokenBucket::new(1000, 2000, Timestamp::ZERO);
        bucket.remove(3000, Timestamp::ZERO);
        assert_eq!(bucket.available(Timestamp::ZERO), -1000);
        assert_eq!(bucket.available(Timestamp::from_millis(1500)), 500);
    }

    #[test]
    fn test_time_until() {
        let mut bucket = TokenBucket::new(1000, 2000, Timestamp::ZERO);
        bucket.remove(2000, Timestamp::ZERO);
        assert_eq!(
            bucket.time_until(500, Timestamp::ZERO),
            Some(Duration::from_millis(500))
        );
        assert_eq!(bucket.time_until(100, Timestamp::from_secs(1)), Some(Duration::ZERO));
        assert_eq!(bucket.time_until(5000, Timestamp::ZERO), None);
    }

    #[test]
    fn test_unlimited() {
        let mut bucket = TokenBucket::unlimited();
        bucket.remove(1_000_000, Timestamp::ZERO);
        assert_eq!(bucket.available(Timestamp::ZERO), i64::MAX);
        assert_eq!(bucket.time_until(10, Timestamp::ZERO), Some(Duration::ZERO));
    }
}
