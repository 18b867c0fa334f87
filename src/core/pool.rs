//! Global worker budget
//!
//! A counting limiter shared by every transfer of a session. Permits are
//! tokens sitting in a bounded crossbeam channel; taking one blocks while
//! the channel is empty and dropping the [`Permit`] puts it back.

use crate::core::state::CancellationToken;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// How often a blocked acquire re-checks cancellation
const ACQUIRE_POLL: Duration = Duration::from_millis(50);

/// Bounded pool of dispatch permits
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    tokens_tx: Sender<()>,
    tokens_rx: Receiver<()>,
    capacity: usize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyLimiter {
    /// Create a limiter with `capacity` permits (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tokens_tx, tokens_rx) = bounded(capacity);
        for _ in 0..capacity {
            // cannot fail: the channel has exactly `capacity` slots
            let _ = tokens_tx.send(());
        }

        Self {
            tokens_tx,
            tokens_rx,
            capacity,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Block until a permit is available
    pub fn acquire(&self) -> Permit<'_> {
        // Both channel ends live in `self`, so recv only fails if never sent
        let _ = self.tokens_rx.recv();
        self.granted()
    }

    /// Block until a permit is available or `cancel` fires
    pub fn acquire_cancellable(&self, cancel: &CancellationToken) -> Option<Permit<'_>> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            match self.tokens_rx.recv_timeout(ACQUIRE_POLL) {
                Ok(()) => return Some(self.granted()),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Take a permit only if one is free right now
    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        self.tokens_rx.try_recv().ok().map(|()| self.granted())
    }

    fn granted(&self) -> Permit<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Permit { limiter: self }
    }

    /// Total permits
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently held
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of permits ever held at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// A held dispatch slot; released on drop
#[derive(Debug)]
pub struct Permit<'a> {
    limiter: &'a ConcurrencyLimiter,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.limiter.in_flight.fetch_sub(1, Ordering::SeqCst);
        let _ = self.limiter.tokens_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_permits_are_returned() {
        let limiter = ConcurrencyLimiter::new(2);
        let a = limiter.acquire();
        let b = limiter.acquire();
        assert_eq!(limiter.in_flight(), 2);
        assert!(limiter.try_acquire().is_none());

        drop(a);
        assert_eq!(limiter.in_flight(), 1);
        assert!(limiter.try_acquire().is_some());
        drop(b);
        assert_eq!(limiter.in_flight(), 0);
        assert_eq!(limiter.peak(), 2);
    }

    #[test]
    fn test_zero_capacity_means_one() {
        assert_eq!(ConcurrencyLimiter::new(0).capacity(), 1);
    }

    #[test]
    fn test_cancel_unblocks_acquire() {
        let limiter = ConcurrencyLimiter::new(1);
        let _held = limiter.acquire();
        let cancel = CancellationToken::new();

        thread::scope(|scope| {
            let waiter = scope.spawn(|| limiter.acquire_cancellable(&cancel).is_none());
            thread::sleep(Duration::from_millis(20));
            cancel.cancel();
            assert!(waiter.join().unwrap());
        });
    }

    #[test]
    fn test_peak_never_exceeds_capacity() {
        let limiter = Arc::new(ConcurrencyLimiter::new(3));

        thread::scope(|scope| {
            for _ in 0..12 {
                let limiter = Arc::clone(&limiter);
                scope.spawn(move || {
                    for _ in 0..20 {
                        let _permit = limiter.acquire();
                        assert!(limiter.in_flight() <= 3);
                        thread::sleep(Duration::from_micros(200));
                    }
                });
            }
        });

        assert_eq!(limiter.in_flight(), 0);
        assert!(limiter.peak() <= 3);
    }
}
