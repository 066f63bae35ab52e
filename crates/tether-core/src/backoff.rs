//! Randomized reconnect backoff.
//!
//! For failure count `n` the delay is drawn uniformly from `[lo(n), hi(n))`:
//!
//! ```text
//! hi(n) = min(base + n * step, cap)
//! lo(n) = min(max(floor, (n - 1) * step), cap)
//! ```
//!
//! The lower bound trails the upper bound by roughly one step, so the window
//! slides forward as failures accumulate while jitter keeps many clients from
//! reconnecting in lockstep.

use std::time::Duration;

/// Added to every upper bound.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Growth per consecutive failure.
pub const DEFAULT_BACKOFF_STEP: Duration = Duration::from_millis(2_000);

/// Smallest lower bound.
pub const DEFAULT_BACKOFF_FLOOR: Duration = Duration::from_millis(250);

/// Largest delay ever returned.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(25);

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Added to every upper bound
    pub base: Duration,
    /// Growth per failure
    pub step: Duration,
    /// Smallest lower bound
    pub floor: Duration,
    /// Ceiling for both bounds
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            step: DEFAULT_BACKOFF_STEP,
            floor: DEFAULT_BACKOFF_FLOOR,
            cap: DEFAULT_BACKOFF_CAP,
        }
    }
}

impl Backoff {
    /// `(lo, hi)` window for `failures` consecutive failures.
    #[must_use]
    pub fn bounds(&self, failures: u32) -> (Duration, Duration) {
        let hi = self.base.saturating_add(self.step.saturating_mul(failures)).min(self.cap);
        let lo = self.step.saturating_mul(failures.saturating_sub(1)).max(self.floor).min(self.cap);
        (lo, hi)
    }

    /// Delay for `failures` consecutive failures, jittered by `entropy`.
    ///
    /// Lies in `[lo, hi)` only while `lo < hi`. When the window is empty
    /// (both bounds at the cap, or a floor configured above the upper bound)
    /// the result is exactly `hi`, which is outside that range.
    #[must_use]
    pub fn delay(&self, failures: u32, entropy: u64) -> Duration {
        let (lo, hi) = self.bounds(failures);
        if lo >= hi {
            return hi;
        }

        let span = u64::try_from((hi - lo).as_millis()).unwrap_or(u64::MAX);
        if span == 0 {
            return lo;
        }

        lo + Duration::from_millis(entropy % span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_failure_window() {
        let backoff = Backoff::default();
        assert_eq!(
            backoff.bounds(1),
            (Duration::from_millis(250), Duration::from_millis(2_500))
        );
    }

    #[test]
    fn window_slides_then_pins_to_cap() {
        let backoff = Backoff::default();
        assert_eq!(
            backoff.bounds(12),
            (Duration::from_millis(22_000), Duration::from_millis(24_500))
        );
        assert_eq!(backoff.bounds(13), (Duration::from_millis(24_000), DEFAULT_BACKOFF_CAP));
        assert_eq!(backoff.bounds(14), (DEFAULT_BACKOFF_CAP, DEFAULT_BACKOFF_CAP));
        assert_eq!(backoff.delay(14, 12_345), DEFAULT_BACKOFF_CAP);
        assert_eq!(backoff.delay(u32::MAX, 0), DEFAULT_BACKOFF_CAP);
    }

    #[test]
    fn empty_window_yields_upper_bound() {
        let backoff = Backoff { floor: Duration::from_secs(3), ..Backoff::default() };
        let (lo, hi) = backoff.bounds(1);
        assert!(lo > hi);
        assert_eq!(backoff.delay(1, 0), hi);
        assert_eq!(backoff.delay(1, u64::MAX), Duration::from_millis(2_500));
    }

    #[test]
    fn entropy_spans_window() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(1, 0), Duration::from_millis(250));
        assert_eq!(backoff.delay(1, 2_249), Duration::from_millis(2_499));
        assert_eq!(backoff.delay(1, 2_250), Duration::from_millis(250));
    }
}
