//! Byte-rate limiting for relayed streams.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A token bucket measured in bytes.
///
/// Capacity is one second's worth of tokens, so bursts are bounded by the
/// configured rate.  Callers ask to spend `n` bytes and are put to sleep
/// until the bucket can cover them.
#[derive(Debug)]
pub(crate) struct RateLimiter {
    /// Refill rate, bytes per second.
    bytes_per_sec: u64,
    /// Current fill level and the time of the last refill.
    state: Mutex<Bucket>,
}

/// Mutable bucket state.
#[derive(Debug)]
struct Bucket {
    /// Available tokens, in bytes.
    tokens: u64,
    /// When tokens were last added.
    refilled: Instant,
}

impl RateLimiter {
    /// Create a limiter of `bytes_per_sec`.
    pub(crate) fn new(bytes_per_sec: u64) -> Self {
        let bytes_per_sec = bytes_per_sec.max(1);
        RateLimiter {
            bytes_per_sec,
            state: Mutex::new(Bucket {
                tokens: bytes_per_sec,
                refilled: Instant::now(),
            }),
        }
    }

    /// Spend `n` bytes, sleeping until the bucket covers them.
    ///
    /// Requests larger than one second's allowance are paid off in
    /// slices.
    pub(crate) async fn throttle(&self, n: usize) {
        let mut owed = n as u64;
        while owed > 0 {
            let (spent, wait) = {
                let mut bucket = self.state.lock().expect("rate limiter poisoned");
                let elapsed = bucket.refilled.elapsed();
                let refill = (elapsed.as_micros() as u64).saturating_mul(self.bytes_per_sec)
                    / 1_000_000;
                if refill > 0 {
                    bucket.tokens = (bucket.tokens + refill).min(self.bytes_per_sec);
                    bucket.refilled = Instant::now();
                }
                let spent = owed.min(bucket.tokens);
                bucket.tokens -= spent;
                let wait = if spent == owed {
                    None
                } else {
                    // Sleep one refill slice; 100ms keeps the stream
                    // smooth without busy-waiting.
                    Some(Duration::from_millis(100))
                };
                (spent, wait)
            };
            owed -= spent;
            if let Some(wait) = wait {
                tokio::time::sleep(wait).await;
            }
        }
    }

    /// A sensible I/O buffer size under this limiter: no point reading
    /// more than the bucket can ever hold.
    pub(crate) fn clamp_buffer(&self, default: usize) -> usize {
        default.min(self.bytes_per_sec as usize).max(1)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[tokio::test]
    async fn fast_path_does_not_sleep() {
        let lim = RateLimiter::new(1_000_000);
        let start = Instant::now();
        lim.throttle(1000).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn throttles_beyond_burst() {
        let lim = RateLimiter::new(10_000);
        // The first second's allowance is free.
        lim.throttle(10_000).await;
        let start = Instant::now();
        // Another 2000 bytes need ~200ms of refill.
        lim.throttle(2_000).await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(100), "waited {:?}", waited);
    }

    #[test]
    fn buffer_clamping() {
        assert_eq!(RateLimiter::new(100).clamp_buffer(512 * 1024), 100);
        assert_eq!(RateLimiter::new(10_000_000).clamp_buffer(4096), 4096);
    }
}
