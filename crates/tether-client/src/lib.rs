//! Async runtime for the tether realtime client.
//!
//! Drives the Sans-IO state machines from [`tether_core`] on tokio and wires
//! them to external collaborators (transport, uploader, repository).
//!
//! # Components
//!
//! - [`socket`]: single owner task for the connection plus a serialized
//!   listener delivery task
//! - [`hub::EventHub`]: fan-out of connection and chat events to filtered
//!   subscriptions
//! - [`send::SendPipeline`]: persist-first message sending with attachment
//!   orchestration
//! - [`error_handler`]: pluggable recovery for failed API calls, including
//!   offline fallbacks
//! - [`repository`]: persistence boundary and an in-memory implementation
//!
//! # Transport (optional)
//!
//! With the `transport` feature enabled, [`transport::quic`] provides a QUIC
//! [`transport::TransportFactory`].

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod error;
pub mod error_handler;
pub mod hub;
pub mod repository;
pub mod send;
pub mod socket;
mod system_env;
pub mod transport;
pub mod upload;

pub use error::{RepositoryError, SendError, TransportError};
pub use hub::{Disposable, EventFilter, EventHub, HubEvent};
pub use send::{Connectivity, MessageTransmitter, SendOutcome, SendPipeline};
pub use socket::{ListenerId, SocketHandle, SocketListener, TokenRefresher};
pub use system_env::SystemEnv;
pub use tether_core::{
    ChatError, ConnectionConfig, ConnectionState, Environment, ErrorCause, SessionInfo,
};
pub use transport::{ConnectRequest, Transport, TransportFactory, TransportSink, UserCredentials};
pub use upload::AttachmentUploader;
