//! CBOR-encoded frame payloads.
//!
//! The header opcode identifies the payload type, so only the inner struct is
//! serialized (no variant tag). Each [`Payload`] variant maps to exactly one
//! [`Opcode`], enforced by exhaustive matches below.

pub mod event;
pub mod message;
pub mod session;

use bytes::BufMut;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    Frame, FrameHeader, Opcode,
    errors::{ProtocolError, Result},
};

/// All frame payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Client handshake
    Connect(session::Connect),
    /// Server handshake acknowledgement
    Connected(session::Connected),
    /// Graceful close
    Goodbye(session::Goodbye),
    /// Chat or health-check event
    Event(event::ChatEvent),
    /// Outbound chat message
    SendMessage(message::MessageEnvelope),
    /// Server error report
    Error(ErrorPayload),
}

/// Error report sent by the server before it drops a connection or rejects
/// a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Application error code, see the associated constants
    pub code: u32,
    /// Human-readable description
    pub message: String,
    /// HTTP-equivalent status code
    #[serde(default)]
    pub status_code: u16,
}

impl ErrorPayload {
    /// API key does not exist.
    pub const API_KEY_NOT_FOUND: u32 = 2;
    /// Request failed validation.
    pub const VALIDATION_ERROR: u32 = 4;
    /// Auth token has expired.
    pub const TOKEN_EXPIRED: u32 = 40;
    /// Auth token is malformed or not valid for this key.
    pub const TOKEN_NOT_VALID: u32 = 41;
    /// Auth token issued-at is in the future.
    pub const TOKEN_DATE_INCORRECT: u32 = 42;
    /// Auth token signature does not verify.
    pub const TOKEN_SIGNATURE_INCORRECT: u32 = 43;

    /// Build an error payload.
    pub fn new(code: u32, message: impl Into<String>, status_code: u16) -> Self {
        Self { code, message: message.into(), status_code }
    }

    /// Codes 40 through 43 concern the auth token.
    #[must_use]
    pub fn is_token_error(&self) -> bool {
        (Self::TOKEN_EXPIRED..=Self::TOKEN_SIGNATURE_INCORRECT).contains(&self.code)
    }
}

fn cbor_decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
}

impl Payload {
    /// Opcode for this payload.
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::Connect(_) => Opcode::Connect,
            Self::Connected(_) => Opcode::Connected,
            Self::Goodbye(_) => Opcode::Goodbye,
            Self::Event(_) => Opcode::Event,
            Self::SendMessage(_) => Opcode::SendMessage,
            Self::Error(_) => Opcode::Error,
        }
    }

    /// Serialize the inner struct into `dst`.
    ///
    /// Size is not checked here; [`Frame::encode`] enforces the cap.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let mut writer = dst.writer();

        match self {
            Self::Connect(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Connected(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Goodbye(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Event(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::SendMessage(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Error(inner) => ciborium::ser::into_writer(inner, &mut writer),
        }
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))
    }

    /// Deserialize the payload for `opcode`.
    ///
    /// The size check runs before CBOR parsing so oversized input is never
    /// handed to the parser.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTooLarge` if `bytes` exceeds the cap
    /// - `ProtocolError::CborDecode` if the bytes do not match the opcode's type
    pub fn decode(opcode: Opcode, bytes: &[u8]) -> Result<Self> {
        if bytes.len() > FrameHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: bytes.len(),
                max: FrameHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        Ok(match opcode {
            Opcode::Connect => Self::Connect(cbor_decode(bytes)?),
            Opcode::Connected => Self::Connected(cbor_decode(bytes)?),
            Opcode::Goodbye => Self::Goodbye(cbor_decode(bytes)?),
            Opcode::Event => Self::Event(cbor_decode(bytes)?),
            Opcode::SendMessage => Self::SendMessage(cbor_decode(bytes)?),
            Opcode::Error => Self::Error(cbor_decode(bytes)?),
        })
    }

    /// Encode into a frame with the matching opcode.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn into_frame(self) -> Result<Frame> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        Ok(Frame::new(FrameHeader::new(self.opcode()), buf))
    }

    /// Typed view of a decoded frame.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::UnknownOpcode` if the header opcode is unassigned
    /// - Any error from [`Payload::decode`]
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let opcode = frame
            .header
            .opcode_enum()
            .ok_or(ProtocolError::UnknownOpcode(frame.header.opcode()))?;
        Self::decode(opcode, &frame.payload)
    }

    /// Encode straight to wire bytes.
    ///
    /// # Errors
    ///
    /// Any error from [`Payload::into_frame`] or [`Frame::encode`].
    pub fn to_wire(self) -> Result<Vec<u8>> {
        self.into_frame()?.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_payload_through_frame() {
        let payload = Payload::Error(ErrorPayload::new(
            ErrorPayload::TOKEN_EXPIRED,
            "token expired",
            401,
        ));

        let frame = payload.clone().into_frame().unwrap();
        assert_eq!(frame.header.opcode_enum(), Some(Opcode::Error));
        assert_eq!(Payload::from_frame(&frame).unwrap(), payload);
    }

    #[test]
    fn token_error_range() {
        assert!(ErrorPayload::new(40, "", 401).is_token_error());
        assert!(ErrorPayload::new(43, "", 401).is_token_error());
        assert!(!ErrorPayload::new(44, "", 400).is_token_error());
        assert!(!ErrorPayload::new(ErrorPayload::API_KEY_NOT_FOUND, "", 401).is_token_error());
    }

    #[test]
    fn mismatched_opcode_fails_to_decode() {
        let frame = Payload::Goodbye(session::Goodbye { code: 1000, reason: "bye".into() })
            .into_frame()
            .unwrap();
        let result = Payload::decode(Opcode::Connected, &frame.payload);
        assert!(matches!(result, Err(ProtocolError::CborDecode(_))));
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let mut frame = Frame::new(FrameHeader::new(Opcode::Event), Vec::new());
        frame.header.opcode = 0x7777u16.to_be_bytes();
        assert_eq!(Payload::from_frame(&frame), Err(ProtocolError::UnknownOpcode(0x7777)));
    }
}
