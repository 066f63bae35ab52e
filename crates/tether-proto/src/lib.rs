//! Wire envelope for the tether realtime connection.
//!
//! Every message on the wire is a [`Frame`]: a fixed 12-byte binary header
//! followed by a CBOR payload. The header carries just enough to route the
//! payload (opcode and length); everything else lives in the typed
//! [`Payload`] variants.
//!
//! # Layout
//!
//! ```text
//! 0      4        5      6        8              12
//! | magic | version | flags | opcode | payload_size | payload ...
//! ```
//!
//! All multi-byte integers are big endian.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod errors;
mod frame;
mod header;
mod opcode;
pub mod payloads;

pub use errors::{ProtocolError, Result};
pub use frame::Frame;
pub use header::FrameHeader;
pub use opcode::Opcode;
pub use payloads::{
    ErrorPayload, Payload,
    event::ChatEvent,
    message::{AttachmentRef, MessageEnvelope},
    session::{Connect, Connected, Goodbye},
};
