//! Error types for the client runtime.

use tether_core::{ChatError, ErrorCause, SyncError, message::OutboundMessage};
use tether_proto::ProtocolError;
use thiserror::Error;

/// Transport and socket failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not establish a transport.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Stream read or write failed.
    #[error("stream error: {0}")]
    Stream(String),

    /// Peer sent malformed data.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// No live, handshaken transport.
    #[error("not connected")]
    NotConnected,

    /// The socket or the transport carrying the write has shut down.
    #[error("socket closed")]
    Closed,
}

impl TransportError {
    /// Classify for the connection state machine. Always transient.
    pub fn into_cause(self) -> ErrorCause {
        match self {
            Self::Protocol(e) => ErrorCause::Protocol(e.to_string()),
            other => ErrorCause::Network(other.to_string()),
        }
    }
}

impl From<TransportError> for ChatError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotConnected | TransportError::Closed => Self::Offline,
            other => Self::Network(other.to_string()),
        }
    }
}

/// Persistence failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
    /// Record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Record kind
        kind: &'static str,
        /// Record id
        id: String,
    },

    /// Backend failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<RepositoryError> for ChatError {
    fn from(err: RepositoryError) -> Self {
        Self::Repository(err.to_string())
    }
}

/// Why a send did not reach `Synced` or `Queued`.
///
/// Variants that carry a message hold it in its final, persisted state.
#[derive(Debug, Error)]
pub enum SendError {
    /// An attachment failed; the message is `Failed`.
    #[error("attachment upload failed: {cause}")]
    AttachmentUpload {
        /// Message as persisted
        message: Box<OutboundMessage>,
        /// Upload failure
        cause: ChatError,
    },

    /// Transmission failed; the message is `Failed`.
    #[error("transmit failed: {cause}")]
    Transmit {
        /// Message as persisted
        message: Box<OutboundMessage>,
        /// Transmit failure
        cause: ChatError,
    },

    /// A later send for the same id replaced this one.
    #[error("superseded by a newer send of {message_id}")]
    Superseded {
        /// Message id
        message_id: String,
    },

    /// `retry` for an id the repository does not know.
    #[error("message not found: {message_id}")]
    NotFound {
        /// Message id
        message_id: String,
    },

    /// Local persistence failed.
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// Invalid sync-status change.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// The send task panicked.
    #[error("send task failed: {0}")]
    Task(String),
}

impl SendError {
    /// The failed message, for errors that leave one behind.
    pub fn message(&self) -> Option<&OutboundMessage> {
        match self {
            Self::AttachmentUpload { message, .. } | Self::Transmit { message, .. } => {
                Some(message.as_ref())
            },
            _ => None,
        }
    }
}
