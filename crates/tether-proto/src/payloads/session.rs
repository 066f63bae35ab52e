//! Handshake and close payloads.

use serde::{Deserialize, Serialize};

/// Client handshake. First frame on every new transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connect {
    /// Application API key
    pub api_key: String,
    /// Connecting user, absent for anonymous connections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Auth token for `user_id`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Server acknowledgement of a [`Connect`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connected {
    /// Opaque id for this session, assigned by the server
    pub connection_id: String,
    /// User the server authenticated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Graceful close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goodbye {
    /// Close code
    pub code: u16,
    /// Free-form reason
    pub reason: String,
}
