//! Core state machines for the tether realtime client.
//!
//! Everything in this crate is Sans-IO: methods take inputs (events, time via
//! [`env::Environment`]) and return actions for a runtime to execute. The
//! async runtime lives in `tether-client`; this crate never spawns, sleeps or
//! touches a socket.
//!
//! # Components
//!
//! - [`connection::Connection`]: connection lifecycle with embedded health
//!   monitoring and reconnect scheduling
//! - [`health::HealthMonitor`]: silence detection and backoff timers
//! - [`backoff::Backoff`]: randomized reconnect delays
//! - [`message`]: outbound message and attachment model with sync-status rules
//! - [`model`]: cached domain objects used by offline recovery

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod backoff;
pub mod connection;
pub mod env;
pub mod error;
pub mod health;
pub mod message;
pub mod model;

pub use backoff::Backoff;
pub use connection::{
    Connection, ConnectionAction, ConnectionConfig, ConnectionState, SessionInfo,
};
pub use env::Environment;
pub use error::{ChatError, ConnectionError, ErrorCause, SyncError};
pub use health::{HealthAction, HealthConfig, HealthMonitor};
pub use message::{
    Attachment, AttachmentAggregate, OutboundMessage, SyncStatus, UploadState, aggregate,
};
