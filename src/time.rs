//! Time sources and bounded polling.
//!
//! Every wait on the bus is a poll loop with a deadline. The loop asks a
//! [`Clock`] for the time and calls [`Clock::relax`] between polls, which is
//! where a real clock spins and a [`ManualClock`] advances simulated time. That
//! keeps the handshake state machine testable without hardware or sleeps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Microsecond timestamp.
pub type Micros = u64;

/// Convert a duration to whole microseconds, saturating.
#[inline]
pub fn micros(duration: Duration) -> Micros {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

/// Monotonic microsecond time source.
pub trait Clock: Send + Sync {
    /// Current time in microseconds since an arbitrary origin.
    fn now_micros(&self) -> Micros;

    /// Called once per iteration of a polling loop.
    fn relax(&self) {
        std::hint::spin_loop();
    }
}

/// Wall-clock time source backed by `Instant`.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Start a clock at zero.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_micros(&self) -> Micros {
        micros(self.origin.elapsed())
    }

    fn relax(&self) {
        std::thread::yield_now();
    }
}

/// Simulated clock for deterministic tests.
///
/// Clones share the same time. Each `relax` advances time by `step`, so a
/// poll loop that never sees its condition still reaches its deadline.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
    step: Micros,
}

impl ManualClock {
    /// Default advance per poll iteration.
    pub const DEFAULT_STEP: Micros = 10;

    /// Start at zero with the default poll step.
    pub fn new() -> Self {
        Self::with_step(Self::DEFAULT_STEP)
    }

    /// Start at zero advancing `step` microseconds per poll.
    pub fn with_step(step: Micros) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(0)),
            step,
        }
    }

    /// Move time forward.
    pub fn advance(&self, duration: Duration) {
        self.now.fetch_add(micros(duration), Ordering::AcqRel);
    }

    /// Move time forward by raw microseconds.
    pub fn advance_micros(&self, us: Micros) {
        self.now.fetch_add(us, Ordering::AcqRel);
    }

    /// Jump to an absolute time. Never moves backwards.
    pub fn set_micros(&self, us: Micros) {
        self.now.fetch_max(us, Ordering::AcqRel);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> Micros {
        self.now.load(Ordering::Acquire)
    }

    fn relax(&self) {
        self.now.fetch_add(self.step, Ordering::AcqRel);
    }
}

/// Poll `ready` until it returns true or `timeout` elapses.
///
/// Returns whether the condition was observed. The condition is always
/// evaluated at least once, even with a zero timeout.
pub fn wait_until<C, F>(clock: &C, timeout: Duration, mut ready: F) -> bool
where
    C: Clock + ?Sized,
    F: FnMut() -> bool,
{
    let deadline = clock.now_micros().saturating_add(micros(timeout));
    loop {
        if ready() {
            return true;
        }
        if clock.now_micros() >= deadline {
            return false;
        }
        clock.relax();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::new();
        let other = clock.clone();

        clock.advance(Duration::from_millis(3));

        assert_eq!(other.now_micros(), 3_000);
    }

    #[test]
    fn test_manual_clock_never_goes_back() {
        let clock = ManualClock::new();
        clock.set_micros(500);
        clock.set_micros(100);
        assert_eq!(clock.now_micros(), 500);
    }

    #[test]
    fn test_wait_until_times_out_on_manual_clock() {
        let clock = ManualClock::with_step(100);

        let seen = wait_until(&clock, Duration::from_millis(1), || false);

        assert!(!seen);
        assert!(clock.now_micros() >= 1_000);
        assert!(clock.now_micros() < 1_200);
    }

    #[test]
    fn test_wait_until_sees_condition() {
        let clock = ManualClock::new();
        let mut polls = 0;

        let seen = wait_until(&clock, Duration::from_millis(1), || {
            polls += 1;
            polls == 3
        });

        assert!(seen);
        assert_eq!(polls, 3);
    }

    #[test]
    fn test_zero_timeout_still_polls_once() {
        let clock = ManualClock::new();
        assert!(wait_until(&clock, Duration::ZERO, || true));
        assert!(!wait_until(&clock, Duration::ZERO, || false));
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let clock = MonotonicClock::new();
        let a = clock.now_micros();
        std::thread::sleep(Duration::from_millis(2));
        assert!(clock.now_micros() >= a + 1_000);
    }
}
