//! Simulated environment: virtual clock plus seeded randomness.

use std::{
    future::Future,
    ops::{Add, Sub},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tether_core::Environment;
use tokio::sync::watch;

/// Wall-clock reading at virtual time zero (2023-11-14T22:13:20Z).
pub const SIM_EPOCH_MILLIS: u64 = 1_700_000_000_000;

/// Instant on the virtual clock: time since the environment was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimInstant(Duration);

impl SimInstant {
    /// Time since the environment was created.
    pub fn elapsed_since_start(self) -> Duration {
        self.0
    }
}

impl Sub for SimInstant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

impl Add<Duration> for SimInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self(self.0 + rhs)
    }
}

/// Deterministic environment for tests.
///
/// Time only moves when the test calls [`advance`](Self::advance); pending
/// [`Environment::sleep`] calls complete once the clock passes their
/// deadline. Randomness comes from a `ChaCha8` stream seeded at construction.
/// Clones share the clock and the RNG.
#[derive(Clone)]
pub struct SimEnv {
    inner: Arc<Inner>,
}

struct Inner {
    seed: u64,
    clock: watch::Sender<Duration>,
    rng: Mutex<ChaCha8Rng>,
}

impl std::fmt::Debug for SimEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimEnv")
            .field("seed", &self.inner.seed)
            .field("elapsed", &self.elapsed())
            .finish()
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::with_seed(0)
    }
}

impl SimEnv {
    /// Environment at virtual time zero with the given RNG seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                seed,
                clock: watch::channel(Duration::ZERO).0,
                rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            }),
        }
    }

    /// Seed this environment was created with.
    pub fn seed(&self) -> u64 {
        self.inner.seed
    }

    /// Move the clock forward, waking sleepers whose deadline has passed.
    pub fn advance(&self, duration: Duration) {
        self.inner.clock.send_modify(|now| *now += duration);
    }

    /// Virtual time since creation.
    pub fn elapsed(&self) -> Duration {
        *self.inner.clock.borrow()
    }
}

impl Environment for SimEnv {
    type Instant = SimInstant;

    fn now(&self) -> SimInstant {
        SimInstant(self.elapsed())
    }

    fn wall_clock_millis(&self) -> u64 {
        SIM_EPOCH_MILLIS + self.elapsed().as_millis() as u64
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        let deadline = self.elapsed() + duration;
        let mut clock = self.inner.clock.subscribe();
        async move {
            // The sender lives as long as any SimEnv clone, so this only
            // errors once the environment is gone.
            let _ = clock.wait_for(|now| *now >= deadline).await;
        }
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.inner.rng.lock().fill_bytes(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_randomness() {
        let a = SimEnv::with_seed(42);
        let b = SimEnv::with_seed(42);
        assert_eq!(a.random_u64(), b.random_u64());
        assert_eq!(a.random_id(), b.random_id());
        assert_ne!(SimEnv::with_seed(43).random_u64(), SimEnv::with_seed(42).random_u64());
    }

    #[test]
    fn clock_only_moves_on_advance() {
        let env = SimEnv::default();
        let start = env.now();
        assert_eq!(env.now(), start);

        env.advance(Duration::from_secs(3));
        assert_eq!(env.now() - start, Duration::from_secs(3));
        assert_eq!(start - env.now(), Duration::ZERO);
        assert_eq!(env.wall_clock_millis(), SIM_EPOCH_MILLIS + 3_000);
    }

    #[tokio::test]
    async fn sleep_wakes_when_clock_passes_deadline() {
        let env = SimEnv::default();
        let sleeper = tokio::spawn({
            let env = env.clone();
            async move { env.sleep(Duration::from_secs(5)).await }
        });

        env.advance(Duration::from_secs(4));
        tokio::task::yield_now().await;
        assert!(!sleeper.is_finished());

        env.advance(Duration::from_secs(1));
        sleeper.await.unwrap();
    }
}
