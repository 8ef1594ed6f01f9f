//! Reconnect backoff for the sync loop.
//!
//! Truncated binary exponential backoff with full jitter: the n-th retry
//! waits a uniform random time in `[0, min(initial * 2^n, max)]`.

use std::time::Duration;

use rand::Rng;

/// Past this many consecutive failures the homeserver is logged as down.
const EXTENDED_OUTAGE_FAILURES: u32 = 5;

#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
    failures: u32,
    /// Largest exponent before `initial * 2^n` passes `max`.
    max_exponent: u32,
}

impl ReconnectBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial_ms = initial.as_millis() as u64;
        let max_ms = max.as_millis() as u64;
        let max_exponent = if initial_ms > 0 && max_ms >= initial_ms {
            (max_ms / initial_ms).ilog2()
        } else {
            0
        };
        Self {
            initial,
            max,
            failures: 0,
            max_exponent: max_exponent.min(20),
        }
    }

    /// Upper bound of the wait for the current failure count.
    pub fn ceiling(&self) -> Duration {
        let exp = self.failures.min(self.max_exponent);
        let ms = (self.initial.as_millis() as u64).saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.max.as_millis() as u64))
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling().as_millis() as u64;
        self.failures = self.failures.saturating_add(1);
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }

    /// Forget past failures after a successful sync.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_extended(&self) -> bool {
        self.failures >= EXTENDED_OUTAGE_FAILURES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_doubles_until_max() {
        let mut b = ReconnectBackoff::new(Duration::from_secs(5), Duration::from_secs(30));
        assert_eq!(b.ceiling(), Duration::from_secs(5));
        b.next_delay();
        assert_eq!(b.ceiling(), Duration::from_secs(10));
        b.next_delay();
        assert_eq!(b.ceiling(), Duration::from_secs(20));
        for _ in 0..50 {
            assert!(b.next_delay() <= Duration::from_secs(30));
        }
        assert_eq!(b.ceiling(), Duration::from_secs(30));
    }

    #[test]
    fn reset_forgets_failures() {
        let mut b = ReconnectBackoff::new(Duration::from_secs(5), Duration::from_secs(300));
        for _ in 0..5 {
            b.next_delay();
        }
        assert!(b.is_extended());
        b.reset();
        assert_eq!(b.failures(), 0);
        assert!(!b.is_extended());
    }

    #[test]
    fn zero_initial_never_waits() {
        let mut b = ReconnectBackoff::new(Duration::ZERO, Duration::from_secs(60));
        assert_eq!(b.next_delay(), Duration::ZERO);
    }
}
