//! Connection health monitoring.
//!
//! The monitor runs a periodic check every `monitor_interval`. Each check
//! (one "cycle") either asks for a health-check frame to be sent or, when no
//! inbound event has been seen for longer than the silence threshold, reports
//! the connection as silent. Reconnect scheduling shares the same timer model
//! so a runtime only ever has to sleep until [`HealthMonitor::next_deadline`].
//!
//! Like the rest of this crate the monitor never sleeps; the caller polls it
//! with the current time.

use std::time::Duration;

use crate::{backoff::Backoff, env::Timestamp};

/// Period of the silence check.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Period between outgoing health checks while connected.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Monitor cycles of grace past one health-check interval before the
/// connection counts as silent.
pub const DEFAULT_SILENCE_CYCLES: u32 = 10;

/// Health monitor configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    /// Period of the silence check
    pub monitor_interval: Duration,
    /// Period between outgoing health checks
    pub health_check_interval: Duration,
    /// Grace cycles added to the silence threshold
    pub silence_cycles: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            silence_cycles: DEFAULT_SILENCE_CYCLES,
        }
    }
}

impl HealthConfig {
    /// Time without inbound events after which the connection is silent.
    #[must_use]
    pub fn silence_threshold(&self) -> Duration {
        self.health_check_interval + self.monitor_interval * self.silence_cycles
    }
}

/// Actions produced by [`HealthMonitor::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    /// Send a health-check frame
    SendHealthCheck,
    /// Nothing was received for `elapsed`; the connection should be recycled
    Silent {
        /// Time since the last inbound event
        elapsed: Duration,
    },
    /// A scheduled reconnect is due
    ReconnectDue,
}

/// Silence detector and reconnect timer.
///
/// # Invariants
///
/// - At most one [`HealthAction::Silent`] per monitor cycle, however late
///   `poll` is called.
/// - `stop()` clears every pending deadline.
#[derive(Debug, Clone)]
pub struct HealthMonitor<I> {
    config: HealthConfig,
    backoff: Backoff,
    last_event: Option<I>,
    last_check: Option<I>,
    next_tick: Option<I>,
    reconnect_at: Option<I>,
    consecutive_failures: u32,
}

impl<I: Timestamp> HealthMonitor<I> {
    /// Stopped monitor with no failures recorded.
    pub fn new(config: HealthConfig, backoff: Backoff) -> Self {
        Self {
            config,
            backoff,
            last_event: None,
            last_check: None,
            next_tick: None,
            reconnect_at: None,
            consecutive_failures: 0,
        }
    }

    /// Begin monitoring from `now`.
    ///
    /// Cancels any pending reconnect. The failure count is kept so backoff
    /// keeps growing across attempts that never reach a healthy state.
    pub fn start(&mut self, now: I) {
        self.last_event = Some(now);
        self.last_check = Some(now);
        self.next_tick = Some(now + self.config.monitor_interval);
        self.reconnect_at = None;
    }

    /// Cancel all pending timers.
    pub fn stop(&mut self) {
        self.last_event = None;
        self.last_check = None;
        self.next_tick = None;
        self.reconnect_at = None;
    }

    /// Record an inbound event: resets the silence clock and the failure count.
    pub fn ack(&mut self, now: I) {
        if self.last_event.is_some() {
            self.last_event = Some(now);
        }
        self.consecutive_failures = 0;
    }

    /// Schedule a reconnect after a failure and stop silence checks.
    ///
    /// Returns the chosen delay.
    pub fn schedule_reconnect(&mut self, now: I, entropy: u64) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let delay = self.backoff.delay(self.consecutive_failures, entropy);

        self.stop();
        self.reconnect_at = Some(now + delay);
        delay
    }

    /// Failures since the last acknowledged event.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether the silence check is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.next_tick.is_some()
    }

    /// Earliest instant at which [`Self::poll`] has work to do.
    #[must_use]
    pub fn next_deadline(&self) -> Option<I> {
        match (self.next_tick, self.reconnect_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Run whatever timers are due at `now`.
    pub fn poll(&mut self, now: I) -> Vec<HealthAction> {
        let mut actions = Vec::new();

        if self.reconnect_at.is_some_and(|at| now >= at) {
            self.reconnect_at = None;
            actions.push(HealthAction::ReconnectDue);
        }

        let (Some(tick), Some(last_event)) = (self.next_tick, self.last_event) else {
            return actions;
        };
        if now < tick {
            return actions;
        }

        // Rescheduled from `now`, not from `tick`: a late poll runs one cycle.
        self.next_tick = Some(now + self.config.monitor_interval);

        let elapsed = now - last_event;
        if elapsed > self.config.silence_threshold() {
            actions.push(HealthAction::Silent { elapsed });
            return actions;
        }

        let check_due = self
            .last_check
            .is_none_or(|last| now - last >= self.config.health_check_interval);
        if check_due {
            self.last_check = Some(now);
            actions.push(HealthAction::SendHealthCheck);
        }

        actions
    }
}
