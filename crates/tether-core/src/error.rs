//! Error types for the tether core.
//!
//! [`ErrorCause`] classifies why a connection failed and decides the recovery
//! path. [`ChatError`] is the failure of a single API call as seen by the
//! error-handler chain. The rest are state machine misuse errors.

use std::time::Duration;

use tether_proto::ErrorPayload;
use thiserror::Error;

use crate::{connection::ConnectionState, message::SyncStatus};

/// Why a connection failed.
///
/// Exactly one of [`is_transient`](Self::is_transient),
/// [`requires_token_refresh`](Self::requires_token_refresh) and
/// [`is_permanent`](Self::is_permanent) holds for every value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ErrorCause {
    /// Auth token expired or was rejected; a fresh token is needed.
    #[error("token rejected ({code}): {message}")]
    TokenRejected {
        /// Server error code (40-43)
        code: u32,
        /// Server message
        message: String,
    },

    /// API key or connect request is invalid. Retrying will not help.
    #[error("invalid credentials ({code}): {message}")]
    InvalidCredentials {
        /// Server error code
        code: u32,
        /// Server message
        message: String,
    },

    /// Any other server-reported error.
    #[error("server error ({code}): {message}")]
    Server {
        /// Server error code
        code: u32,
        /// Server message
        message: String,
    },

    /// Transport failed or dropped.
    #[error("network: {0}")]
    Network(String),

    /// Peer sent something we could not parse.
    #[error("protocol: {0}")]
    Protocol(String),

    /// No inbound events within the silence threshold.
    #[error("no events for {elapsed:?}")]
    HealthTimeout {
        /// Time since the last inbound event
        elapsed: Duration,
    },
}

impl ErrorCause {
    /// Classify a server error code.
    pub fn from_code(code: u32, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            ErrorPayload::TOKEN_EXPIRED..=ErrorPayload::TOKEN_SIGNATURE_INCORRECT => {
                Self::TokenRejected { code, message }
            },
            ErrorPayload::API_KEY_NOT_FOUND | ErrorPayload::VALIDATION_ERROR => {
                Self::InvalidCredentials { code, message }
            },
            _ => Self::Server { code, message },
        }
    }

    /// Recovered by reconnecting with backoff.
    pub fn is_transient(&self) -> bool {
        !self.requires_token_refresh() && !self.is_permanent()
    }

    /// Reconnect must wait for a token refresh.
    pub fn requires_token_refresh(&self) -> bool {
        matches!(self, Self::TokenRejected { .. })
    }

    /// No reconnect until the application calls `connect` again.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::InvalidCredentials { .. })
    }
}

impl From<&ErrorPayload> for ErrorCause {
    fn from(payload: &ErrorPayload) -> Self {
        Self::from_code(payload.code, payload.message.clone())
    }
}

/// Misuse of the connection state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Operation is not valid in the current state
    #[error("invalid state transition: cannot {operation} from {state:?}")]
    InvalidState {
        /// Current state when error occurred
        state: ConnectionState,
        /// Operation that was attempted
        operation: &'static str,
    },
}

/// Failure of a single API call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// Request could not reach the server.
    #[error("network error: {0}")]
    Network(String),

    /// No connection is available.
    #[error("offline")]
    Offline,

    /// Server rejected the request.
    #[error("api error {code} (status {status}): {message}")]
    Api {
        /// Application error code
        code: u32,
        /// HTTP-equivalent status
        status: u16,
        /// Server message
        message: String,
    },

    /// An attachment failed to upload.
    #[error("attachment {attachment_id} failed to upload: {reason}")]
    AttachmentUpload {
        /// Failing attachment
        attachment_id: String,
        /// Uploader's reason
        reason: String,
    },

    /// Local storage failed.
    #[error("repository: {0}")]
    Repository(String),

    /// The call was cancelled.
    #[error("cancelled")]
    Cancelled,
}

impl ChatError {
    /// Failures caused by missing connectivity.
    ///
    /// Offline handlers only substitute results for these.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Offline)
    }
}

/// Invalid message or attachment state change.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Transition not allowed by the sync-status rules
    #[error("cannot move sync status from {from:?} to {to:?}")]
    InvalidTransition {
        /// Current status
        from: SyncStatus,
        /// Requested status
        to: SyncStatus,
    },

    /// `Synced` requested while attachments are not all uploaded
    #[error("{pending} attachment(s) not uploaded")]
    AttachmentsPending {
        /// Attachments not yet in `Success`
        pending: usize,
    },
}
