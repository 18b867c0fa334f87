//! Bandwidth throttling for part reads and writes
//!
//! Implements rate limiting using the Governor crate for smooth,
//! token-bucket based bandwidth control. One limiter is shared by every
//! worker of a session, so the limit applies to the aggregate rate.

use crate::core::CancellationToken;
use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

/// Bytes represented by one limiter token
const BYTES_PER_TOKEN: u64 = 1024;

/// Longest single sleep, so cancellation is noticed promptly
const MAX_WAIT_SLICE: Duration = Duration::from_millis(50);

/// Bandwidth limiter for controlling transfer rates
#[derive(Clone)]
pub struct BandwidthLimiter {
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    clock: DefaultClock,
    burst: NonZeroU32,
    bytes_per_second: u64,
}

impl BandwidthLimiter {
    /// Create a new bandwidth limiter
    ///
    /// # Example
    /// ```
    /// use bulkxfer::fs::BandwidthLimiter;
    /// let limiter = BandwidthLimiter::new(100 * 1024 * 1024); // 100 MB/s
    /// assert_eq!(limiter.bytes_per_second(), 100 * 1024 * 1024);
    /// ```
    pub fn new(bytes_per_second: u64) -> Self {
        let tokens_per_second = (bytes_per_second / BYTES_PER_TOKEN).clamp(1, u32::MAX as u64);
        let rate = NonZeroU32::new(tokens_per_second as u32).unwrap_or(NonZeroU32::MIN);

        // One second worth of tokens may be taken at once
        let quota = Quota::per_second(rate).allow_burst(rate);
        let clock = DefaultClock::default();

        Self {
            limiter: Arc::new(RateLimiter::direct_with_clock(quota, &clock)),
            clock,
            burst: rate,
            bytes_per_second,
        }
    }

    /// Configured rate
    pub fn bytes_per_second(&self) -> u64 {
        self.bytes_per_second
    }

    /// Block until `bytes` may be transferred
    ///
    /// Returns `false` if cancellation was requested while waiting.
    pub fn wait_for_capacity(&self, bytes: u64, cancel: &CancellationToken) -> bool {
        let mut tokens = bytes.div_ceil(BYTES_PER_TOKEN).max(1);

        while tokens > 0 {
            let batch = tokens.min(self.burst.get() as u64) as u32;
            let Some(n) = NonZeroU32::new(batch) else {
                break;
            };

            loop {
                if cancel.is_cancelled() {
                    return false;
                }
                match self.limiter.check_n(n) {
                    Ok(Ok(())) => break,
                    Ok(Err(not_until)) => {
                        let wait = not_until.wait_time_from(self.clock.now());
                        std::thread::sleep(wait.min(MAX_WAIT_SLICE));
                    }
                    // batch never exceeds the burst size
                    Err(_) => break,
                }
            }
            tokens -= batch as u64;
        }
        true
    }

    /// Try to acquire capacity without blocking
    pub fn try_acquire(&self, bytes: u64) -> bool {
        let tokens = bytes.div_ceil(BYTES_PER_TOKEN).clamp(1, self.burst.get() as u64) as u32;
        NonZeroU32::new(tokens)
            .map(|n| matches!(self.limiter.check_n(n), Ok(Ok(()))))
            .unwrap_or(true)
    }
}

impl std::fmt::Debug for BandwidthLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandwidthLimiter")
            .field("bytes_per_second", &self.bytes_per_second)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_limiter_creation() {
        let limiter = BandwidthLimiter::new(100 * 1024 * 1024); // 100 MB/s
        assert!(limiter.try_acquire(1024)); // Should have initial capacity
    }

    #[test]
    fn test_burst_then_throttle() {
        // 64 KiB/s, burst of one second
        let limiter = BandwidthLimiter::new(64 * 1024);
        let cancel = CancellationToken::new();

        let start = Instant::now();
        assert!(limiter.wait_for_capacity(64 * 1024, &cancel));
        assert!(start.elapsed() < Duration::from_millis(500));

        // the next 16 KiB needs roughly a quarter second
        assert!(limiter.wait_for_capacity(16 * 1024, &cancel));
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn test_cancelled_wait_returns_false() {
        let limiter = BandwidthLimiter::new(1024);
        let cancel = CancellationToken::new();
        assert!(limiter.wait_for_capacity(1024, &cancel));

        cancel.cancel();
        assert!(!limiter.wait_for_capacity(1024 * 1024, &cancel));
    }
}
