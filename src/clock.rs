//! Monotonic clocks
//!
//! The manager reads time only through [`Clock`]. Sleeping is the single
//! blocking point of a poll iteration, so it also lives here: a bare-metal
//! clock can wait for an interrupt, the host clock sleeps the thread, and the
//! [`ManualClock`] simply moves virtual time forward.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

/// Millisecond monotonic time source
pub trait Clock {
    /// Milliseconds since an arbitrary fixed origin
    fn now_ms(&self) -> u64;

    /// Block for at most `ms` milliseconds
    fn sleep_ms(&self, ms: u64) {
        let _ = ms;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MANUAL CLOCK
// ═══════════════════════════════════════════════════════════════════════════════

/// Virtual clock shared between clones
///
/// `sleep_ms` advances the shared time instead of blocking, which makes idle
/// polls deterministic in tests and simulations.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    /// Jump to `ms`; time never moves backwards
    pub fn set(&self, ms: u64) {
        self.now.fetch_max(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep_ms(&self, ms: u64) {
        self.advance(ms);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HOST CLOCK
// ═══════════════════════════════════════════════════════════════════════════════

/// Wall-clock backed by `std::time::Instant`
#[cfg(feature = "std")]
#[derive(Debug, Clone)]
pub struct StdClock {
    start: std::time::Instant,
}

#[cfg(feature = "std")]
impl StdClock {
    pub fn new() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }
}

#[cfg(feature = "std")]
impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl Clock for StdClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis().min(u64::MAX as u128) as u64
    }

    fn sleep_ms(&self, ms: u64) {
        if ms > 0 {
            std::thread::sleep(std::time::Duration::from_millis(ms));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let a = ManualClock::new(100);
        let b = a.clone();
        b.advance(50);
        assert_eq!(a.now_ms(), 150);
        a.sleep_ms(25);
        assert_eq!(b.now_ms(), 175);
    }

    #[test]
    fn test_manual_clock_never_goes_back() {
        let clock = ManualClock::new(1000);
        clock.set(10);
        assert_eq!(clock.now_ms(), 1000);
        clock.set(2000);
        assert_eq!(clock.now_ms(), 2000);
    }
}
