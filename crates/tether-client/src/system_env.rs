//! Production environment: tokio clock and OS entropy.

use std::time::Duration;

use tether_core::env::Environment;

/// Production environment.
///
/// Uses `tokio::time::Instant` so a paused tokio clock (tests) controls every
/// timer, `tokio::time::sleep` for sleeping and getrandom for entropy.
///
/// # Panics
///
/// Panics if the OS RNG fails. Ids and backoff jitter cannot be produced
/// without it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = tokio::time::Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }

    #[allow(clippy::disallowed_methods)]
    fn wall_clock_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64)
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure is unrecoverable");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_differ() {
        let env = SystemEnv::new();
        let a = env.random_id();
        let b = env.random_id();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_follows_paused_clock() {
        let env = SystemEnv::new();

        let start = env.now();
        env.sleep(Duration::from_secs(30)).await;
        assert!(env.now() - start >= Duration::from_secs(30));
    }
}
