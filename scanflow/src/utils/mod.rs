//! Small shared helpers: the clock abstraction and duration conversions.

mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

#[cfg(test)]
pub(crate) use clock::MockClock;

use std::time::{Duration, Instant};

/// Milliseconds elapsed since `start`, with sub-millisecond precision.
#[must_use]
pub fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Converts a duration to whole milliseconds, saturating at `u64::MAX`.
#[must_use]
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_ms() {
        assert_eq!(duration_ms(Duration::from_millis(1500)), 1500);
        assert_eq!(duration_ms(Duration::ZERO), 0);
    }

    #[test]
    fn test_elapsed_ms_non_negative() {
        assert!(elapsed_ms(Instant::now()) >= 0.0);
    }
}
