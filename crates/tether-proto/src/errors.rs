//! Protocol-level errors.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while framing or parsing wire data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer is shorter than the fixed header.
    #[error("frame too short: expected {expected} bytes, got {actual}")]
    FrameTooShort {
        /// Required length
        expected: usize,
        /// Available length
        actual: usize,
    },

    /// Header claims more payload bytes than the buffer holds.
    #[error("frame truncated: payload expected {expected} bytes, got {actual}")]
    FrameTruncated {
        /// Payload length claimed by the header
        expected: usize,
        /// Payload bytes actually present
        actual: usize,
    },

    /// Magic bytes do not identify a tether frame.
    #[error("invalid magic number")]
    InvalidMagic,

    /// Header version is not one we speak.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Payload exceeds [`crate::FrameHeader::MAX_PAYLOAD_SIZE`].
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Offending size
        size: usize,
        /// Allowed maximum
        max: usize,
    },

    /// Opcode is not assigned.
    #[error("unknown opcode: {0:#06x}")]
    UnknownOpcode(u16),

    /// CBOR serialization failed.
    #[error("cbor encode: {0}")]
    CborEncode(String),

    /// CBOR deserialization failed.
    #[error("cbor decode: {0}")]
    CborDecode(String),
}
