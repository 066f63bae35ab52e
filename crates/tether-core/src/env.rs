//! Environment abstraction for deterministic testing.
//!
//! Decouples state machine logic from system resources (time, randomness).
//! Production uses the tokio clock and OS entropy; tests use a virtual clock
//! and a seeded RNG.

use std::{
    fmt::Debug,
    future::Future,
    ops::{Add, Sub},
    time::Duration,
};

/// Monotonic instant usable as a deadline.
///
/// Blanket-implemented for any type with the required arithmetic, so both
/// `tokio::time::Instant` and virtual clocks qualify.
pub trait Timestamp:
    Copy + Ord + Send + Sync + Debug + Sub<Output = Duration> + Add<Duration, Output = Self>
{
}

impl<T> Timestamp for T where
    T: Copy + Ord + Send + Sync + Debug + Sub<Output = Duration> + Add<Duration, Output = T>
{
}

/// Abstract environment providing time, randomness, and sleeping.
///
/// Implementations MUST guarantee that `now()` never goes backwards.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Instant type of this environment's monotonic clock.
    type Instant: Timestamp;

    /// Current monotonic time.
    fn now(&self) -> Self::Instant;

    /// Wall-clock time in milliseconds since the Unix epoch.
    ///
    /// Only used to stamp records; never for timers.
    fn wall_clock_millis(&self) -> u64;

    /// Sleep for `duration`.
    ///
    /// Only runtime code awaits this; state machines never do.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;

    /// Fill `buffer` with random bytes.
    ///
    /// Given the same seed, simulated environments produce the same sequence.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Random `u64`, used for backoff jitter.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Random 128-bit identifier rendered as 32 hex digits.
    ///
    /// Used for client-assigned message and upload ids.
    fn random_id(&self) -> String {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        format!("{:032x}", u128::from_be_bytes(bytes))
    }
}
