//! Monotonic time for event timestamps.
//!
//! Raw events carry the kernel's monotonic clock in nanoseconds; everything
//! downstream compares and schedules against the same time base.

use rustix::time::{ClockId, Timespec};

/// Monotonic nanoseconds. Matches the clock used by the kernel event device
/// driver, so event timestamps and `Clock::now` values are directly
/// comparable.
pub type Nanos = i64;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Monotonic clock source.
#[derive(Debug, Default, Clone, Copy)]
pub struct Clock;

impl Clock {
    /// Initialize a new clock.
    pub fn new() -> Self {
        Clock
    }

    /// Returns the current time in monotonic nanoseconds.
    pub fn now(&self) -> Nanos {
        nanos_from_timespec(rustix::time::clock_gettime(ClockId::Monotonic))
    }
}

/// Converts a timespec to monotonic nanoseconds.
pub fn nanos_from_timespec(tp: Timespec) -> Nanos {
    debug_assert!(tp.tv_sec >= 0);
    debug_assert!(tp.tv_nsec >= 0);
    tp.tv_sec as i64 * NANOS_PER_SEC + tp.tv_nsec as i64
}

/// Computes a millisecond timeout suitable for a poll call from a deadline.
///
/// Returns 0 when the deadline has already passed and rounds partial
/// milliseconds up so that the wait never returns early.
pub fn millis_until(now: Nanos, deadline: Nanos) -> i32 {
    if deadline <= now {
        return 0;
    }
    let delay = deadline - now;
    let millis = (delay + 999_999) / 1_000_000;
    millis.min(i32::MAX as i64) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic() {
        let clock = Clock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(a >= 0);
        assert!(b >= a);
    }

    #[test]
    fn millis_rounds_up() {
        assert_eq!(millis_until(0, 0), 0);
        assert_eq!(millis_until(10, 5), 0);
        assert_eq!(millis_until(0, 1), 1);
        assert_eq!(millis_until(0, 1_000_000), 1);
        assert_eq!(millis_until(0, 1_000_001), 2);
        assert_eq!(millis_until(5_000_000, 8_500_000), 4);
    }
}
