//! Connection lifecycle state machine.
//!
//! Owns the state of the single realtime connection and the embedded
//! [`HealthMonitor`]. Uses the action pattern: every mutator returns the
//! actions the runtime must execute (publish a state, open or close the
//! transport, send a health check, refresh the token). The runtime applies
//! them in order, so every `Publish` is a point where listeners see the new
//! state and never an intermediate one.
//!
//! # State Machine
//!
//! ```text
//!                connect            session established
//! ┌──────────────┐ ─────> ┌────────────┐ ─────────> ┌───────────┐
//! │ Disconnected │        │ Connecting │            │ Connected │
//! └──────────────┘ <─┐    └────────────┘            └───────────┘
//!        ^           │          │ error                   │ error / silence
//!        │           │          v                         v
//!        │           │     ┌─────────┐                    │
//!        │           └─────│  Error  │<───────────────────┘
//!        │                 └─────────┘
//!        └──────── disconnect (will_reconnect = false)
//! ```
//!
//! `Error` is only ever published immediately before a `Disconnected`; it is
//! never a resting state.

use std::time::Duration;

use tether_proto::ChatEvent;

use crate::{
    backoff::Backoff,
    env::Environment,
    error::{ConnectionError, ErrorCause},
    health::{HealthAction, HealthConfig, HealthMonitor},
};

/// Close code for client-initiated closes.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code used when the connection is dropped after an error.
pub const CLOSE_ERROR: u16 = 4000;

/// Session details assigned by the server during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Opaque connection id
    pub connection_id: String,
    /// Authenticated user, if any
    pub user_id: Option<String>,
}

/// Connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport. `will_reconnect` tells whether a reconnect is pending.
    Disconnected {
        /// A reconnect will happen without application involvement
        will_reconnect: bool,
    },
    /// Transport requested, handshake not finished
    Connecting,
    /// Handshake finished
    Connected(SessionInfo),
    /// Transport failed; always followed by `Disconnected`
    Error(ErrorCause),
}

impl ConnectionState {
    /// Initial state of a fresh connection.
    pub const INITIAL: Self = Self::Disconnected { will_reconnect: true };
}

/// Actions returned by the connection state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// The state changed to this value; notify listeners
    Publish(ConnectionState),
    /// Fan this event out to subscribers
    Deliver(ChatEvent),
    /// Open a new transport with the current credentials
    OpenTransport,
    /// Close the live transport
    CloseTransport {
        /// Close code
        code: u16,
        /// Human-readable reason
        reason: String,
    },
    /// Write a health-check event to the transport
    SendHealthCheck,
    /// Obtain a fresh auth token, then call [`Connection::on_token_refreshed`]
    RefreshToken,
    /// A reconnect was scheduled (informational)
    ReconnectScheduled {
        /// Backoff delay before the attempt
        delay: Duration,
        /// Consecutive failures so far
        attempt: u32,
    },
}

/// Connection configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Health monitor timing
    pub health: HealthConfig,
    /// Reconnect backoff
    pub backoff: Backoff,
}

/// Connection state machine.
///
/// Pure logic: no I/O. Time and jitter come from the stored
/// [`Environment`].
#[derive(Debug, Clone)]
pub struct Connection<E: Environment> {
    env: E,
    state: ConnectionState,
    health: HealthMonitor<E::Instant>,
    awaiting_refresh: bool,
}

impl<E: Environment> Connection<E> {
    /// Create a connection in [`ConnectionState::INITIAL`].
    pub fn new(env: E, config: ConnectionConfig) -> Self {
        Self {
            env,
            state: ConnectionState::INITIAL,
            health: HealthMonitor::new(config.health, config.backoff),
            awaiting_refresh: false,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Session of the current connection. `None` unless connected.
    #[must_use]
    pub fn session(&self) -> Option<&SessionInfo> {
        match &self.state {
            ConnectionState::Connected(session) => Some(session),
            _ => None,
        }
    }

    /// Whether a handshake has completed on the live transport.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected(_))
    }

    /// Consecutive failed attempts since the last healthy event.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.health.consecutive_failures()
    }

    /// Earliest instant at which [`Self::tick`] has work to do.
    #[must_use]
    pub fn next_deadline(&self) -> Option<E::Instant> {
        self.health.next_deadline()
    }

    /// Start a fresh connection attempt.
    ///
    /// A live or pending connection is torn down first and
    /// `Disconnected { will_reconnect: true }` is published before
    /// `Connecting`.
    pub fn connect(&mut self) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();

        if matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected(_)) {
            actions.push(ConnectionAction::CloseTransport {
                code: CLOSE_NORMAL,
                reason: "reconnect".to_string(),
            });
            actions.push(self.publish(ConnectionState::Disconnected { will_reconnect: true }));
        }

        self.awaiting_refresh = false;
        self.health.stop();
        self.health.start(self.env.now());

        actions.push(self.publish(ConnectionState::Connecting));
        actions.push(ConnectionAction::OpenTransport);
        actions
    }

    /// End the session.
    ///
    /// Stops every health timer before returning. Idempotent: calling it on
    /// an already terminated connection returns no actions.
    pub fn disconnect(&mut self) -> Vec<ConnectionAction> {
        self.health.stop();
        self.awaiting_refresh = false;

        let mut actions = Vec::new();
        match self.state {
            ConnectionState::Disconnected { will_reconnect: false } => return actions,
            ConnectionState::Connecting | ConnectionState::Connected(_) => {
                actions.push(ConnectionAction::CloseTransport {
                    code: CLOSE_NORMAL,
                    reason: "client disconnect".to_string(),
                });
            },
            ConnectionState::Disconnected { will_reconnect: true } | ConnectionState::Error(_) => {
            },
        }

        actions.push(self.publish(ConnectionState::Disconnected { will_reconnect: false }));
        actions
    }

    /// The server accepted the handshake.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::InvalidState` unless connecting
    pub fn on_session_established(
        &mut self,
        session: SessionInfo,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        if self.state != ConnectionState::Connecting {
            return Err(self.invalid("establish session"));
        }

        self.health.ack(self.env.now());
        Ok(vec![self.publish(ConnectionState::Connected(session))])
    }

    /// An event arrived on the live transport.
    ///
    /// Every event acknowledges the health monitor. Health checks stop here;
    /// everything else is returned for delivery.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::InvalidState` unless connected
    pub fn on_raw_event(
        &mut self,
        event: ChatEvent,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        if !self.is_connected() {
            return Err(self.invalid("receive event"));
        }

        self.health.ack(self.env.now());

        if event.is_health_check() {
            return Ok(Vec::new());
        }
        Ok(vec![ConnectionAction::Deliver(event)])
    }

    /// The live transport failed.
    ///
    /// Publishes `Error(cause)` followed by the `Disconnected` state the
    /// cause dictates. Ignored when there is no live transport.
    pub fn on_transport_error(&mut self, cause: ErrorCause) -> Vec<ConnectionAction> {
        if matches!(self.state, ConnectionState::Disconnected { .. }) {
            return Vec::new();
        }

        self.health.stop();

        let mut actions = vec![ConnectionAction::CloseTransport {
            code: CLOSE_ERROR,
            reason: cause.to_string(),
        }];
        actions.push(self.publish(ConnectionState::Error(cause.clone())));

        if cause.requires_token_refresh() {
            self.awaiting_refresh = true;
            actions.push(self.publish(ConnectionState::Disconnected { will_reconnect: false }));
            actions.push(ConnectionAction::RefreshToken);
        } else if cause.is_permanent() {
            actions.push(self.publish(ConnectionState::Disconnected { will_reconnect: false }));
        } else {
            let delay = self.health.schedule_reconnect(self.env.now(), self.env.random_u64());
            actions.push(self.publish(ConnectionState::Disconnected { will_reconnect: true }));
            actions.push(ConnectionAction::ReconnectScheduled {
                delay,
                attempt: self.health.consecutive_failures(),
            });
        }

        actions
    }

    /// A token refresh requested via [`ConnectionAction::RefreshToken`]
    /// finished. Resumes connecting if still waiting for it.
    pub fn on_token_refreshed(&mut self) -> Vec<ConnectionAction> {
        if !self.awaiting_refresh {
            return Vec::new();
        }
        self.connect()
    }

    /// Run due timers.
    pub fn tick(&mut self) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();

        for action in self.health.poll(self.env.now()) {
            match action {
                HealthAction::SendHealthCheck => {
                    if self.is_connected() {
                        actions.push(ConnectionAction::SendHealthCheck);
                    }
                },
                HealthAction::Silent { elapsed } => {
                    actions.extend(self.on_transport_error(ErrorCause::HealthTimeout { elapsed }));
                },
                HealthAction::ReconnectDue => {
                    if self.state == (ConnectionState::Disconnected { will_reconnect: true }) {
                        actions.extend(self.connect());
                    }
                },
            }
        }

        actions
    }

    fn publish(&mut self, state: ConnectionState) -> ConnectionAction {
        self.state = state.clone();
        ConnectionAction::Publish(state)
    }

    fn invalid(&self, operation: &'static str) -> ConnectionError {
        ConnectionError::InvalidState { state: self.state.clone(), operation }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::test_utils::MockEnv;

    fn session() -> SessionInfo {
        SessionInfo { connection_id: "conn-1".into(), user_id: Some("alice".into()) }
    }

    fn published(actions: &[ConnectionAction]) -> Vec<ConnectionState> {
        actions
            .iter()
            .filter_map(|a| match a {
                ConnectionAction::Publish(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    fn connected(env: &MockEnv) -> Connection<MockEnv> {
        let mut conn = Connection::new(env.clone(), ConnectionConfig::default());
        conn.connect();
        conn.on_session_established(session()).unwrap();
        conn
    }

    #[test]
    fn connection_lifecycle() {
        let env = MockEnv::default();
        let mut conn = Connection::new(env.clone(), ConnectionConfig::default());
        assert_eq!(conn.state(), &ConnectionState::INITIAL);

        let actions = conn.connect();
        assert_eq!(actions, vec![
            ConnectionAction::Publish(ConnectionState::Connecting),
            ConnectionAction::OpenTransport,
        ]);

        let actions = conn.on_session_established(session()).unwrap();
        assert_eq!(published(&actions), vec![ConnectionState::Connected(session())]);
        assert_eq!(conn.session(), Some(&session()));

        let actions = conn.disconnect();
        assert!(matches!(actions[0], ConnectionAction::CloseTransport { code: CLOSE_NORMAL, .. }));
        assert_eq!(published(&actions), vec![ConnectionState::Disconnected {
            will_reconnect: false
        }]);
        assert_eq!(conn.session(), None);
        assert_eq!(conn.next_deadline(), None);

        assert!(conn.disconnect().is_empty());
    }

    #[test]
    fn connect_while_connected_passes_through_disconnected() {
        let env = MockEnv::default();
        let mut conn = connected(&env);

        let actions = conn.connect();
        assert!(matches!(actions[0], ConnectionAction::CloseTransport { .. }));
        assert_eq!(published(&actions), vec![
            ConnectionState::Disconnected { will_reconnect: true },
            ConnectionState::Connecting,
        ]);
        assert_eq!(actions.last(), Some(&ConnectionAction::OpenTransport));
    }

    #[test]
    fn session_requires_connecting() {
        let env = MockEnv::default();
        let mut conn = Connection::new(env, ConnectionConfig::default());

        let result = conn.on_session_established(session());
        assert!(matches!(result, Err(ConnectionError::InvalidState { .. })));
    }

    #[test]
    fn health_checks_are_not_delivered() {
        let env = MockEnv::default();
        let mut conn = connected(&env);

        assert!(conn.on_raw_event(ChatEvent::health_check(0)).unwrap().is_empty());

        let event = ChatEvent::new("message.new", Some("messaging:1".into()), 0);
        assert_eq!(conn.on_raw_event(event.clone()).unwrap(), vec![ConnectionAction::Deliver(
            event
        )]);
    }

    #[test]
    fn transient_error_schedules_reconnect() {
        let env = MockEnv::default();
        let mut conn = connected(&env);

        let cause = ErrorCause::Network("reset".into());
        let actions = conn.on_transport_error(cause.clone());
        assert_eq!(published(&actions), vec![
            ConnectionState::Error(cause),
            ConnectionState::Disconnected { will_reconnect: true },
        ]);
        let Some(ConnectionAction::ReconnectScheduled { delay, attempt: 1 }) = actions.last()
        else {
            panic!("expected reconnect to be scheduled: {actions:?}");
        };

        env.advance(*delay);
        let actions = conn.tick();
        assert_eq!(published(&actions), vec![ConnectionState::Connecting]);
        assert!(actions.contains(&ConnectionAction::OpenTransport));
    }

    #[test]
    fn token_error_waits_for_refresh() {
        let env = MockEnv::default();
        let mut conn = connected(&env);

        let actions = conn.on_transport_error(ErrorCause::from_code(40, "expired"));
        assert_eq!(actions.last(), Some(&ConnectionAction::RefreshToken));
        assert_eq!(conn.state(), &ConnectionState::Disconnected { will_reconnect: false });
        assert_eq!(conn.next_deadline(), None);

        let actions = conn.on_token_refreshed();
        assert_eq!(published(&actions), vec![ConnectionState::Connecting]);

        // A second refresh notification is a no-op.
        assert!(conn.on_token_refreshed().is_empty());
    }

    #[test]
    fn permanent_error_stops_for_good() {
        let env = MockEnv::default();
        let mut conn = connected(&env);

        let actions = conn.on_transport_error(ErrorCause::from_code(2, "api key not found"));
        assert_eq!(conn.state(), &ConnectionState::Disconnected { will_reconnect: false });
        assert!(!actions.contains(&ConnectionAction::RefreshToken));
        assert_eq!(conn.next_deadline(), None);

        env.advance(Duration::from_secs(3600));
        assert!(conn.tick().is_empty());
    }

    #[test]
    fn errors_after_disconnect_are_ignored() {
        let env = MockEnv::default();
        let mut conn = connected(&env);
        conn.disconnect();

        assert!(conn.on_transport_error(ErrorCause::Network("late".into())).is_empty());
        assert_eq!(conn.state(), &ConnectionState::Disconnected { will_reconnect: false });
    }

    #[test]
    fn disconnect_cancels_pending_reconnect() {
        let env = MockEnv::default();
        let mut conn = connected(&env);
        conn.on_transport_error(ErrorCause::Network("reset".into()));
        assert!(conn.next_deadline().is_some());

        conn.disconnect();
        assert_eq!(conn.next_deadline(), None);
        env.advance(Duration::from_secs(60));
        assert!(conn.tick().is_empty());
    }

    #[test]
    fn silence_recycles_the_connection() {
        let env = MockEnv::default();
        let mut conn = connected(&env);

        let mut silence = Vec::new();
        for _ in 0..25 {
            env.advance(Duration::from_secs(1));
            silence.extend(conn.tick());
        }

        let errors: Vec<_> = published(&silence)
            .into_iter()
            .filter(|s| matches!(s, ConnectionState::Error(ErrorCause::HealthTimeout { .. })))
            .collect();
        assert_eq!(errors.len(), 1);
        assert!(silence.contains(&ConnectionAction::SendHealthCheck));
    }
}
