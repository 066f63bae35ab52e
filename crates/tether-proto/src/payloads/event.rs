//! Server-pushed chat events.

use serde::{Deserialize, Serialize};

/// A server-pushed event.
///
/// Only the envelope fields needed for routing are typed; the domain object
/// itself travels opaque in `body`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEvent {
    /// Event type, e.g. `message.new`
    pub event_type: String,
    /// Channel id (`type:id`) the event belongs to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    /// Creation time, milliseconds since the Unix epoch
    pub created_at: u64,
    /// Encoded domain object
    #[serde(default)]
    pub body: Vec<u8>,
}

impl ChatEvent {
    /// Event type of keepalive events.
    pub const HEALTH_CHECK: &'static str = "health.check";

    /// Build an event with an empty body.
    pub fn new(event_type: impl Into<String>, cid: Option<String>, created_at: u64) -> Self {
        Self { event_type: event_type.into(), cid, created_at, body: Vec::new() }
    }

    /// Keepalive event.
    #[must_use]
    pub fn health_check(created_at: u64) -> Self {
        Self::new(Self::HEALTH_CHECK, None, created_at)
    }

    /// Whether this is a keepalive rather than a domain event.
    #[must_use]
    pub fn is_health_check(&self) -> bool {
        self.event_type == Self::HEALTH_CHECK
    }
}
