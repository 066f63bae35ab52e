//! Frame type combining header and raw payload bytes.

use bytes::{BufMut, Bytes};

use crate::{
    FrameHeader,
    errors::{ProtocolError, Result},
};

/// Complete wire frame.
///
/// Layout: `[FrameHeader: 12 bytes] + [payload: payload_size bytes]`.
///
/// # Invariants
///
/// - `payload.len()` equals `header.payload_size()`. [`Frame::new`] sets the
///   size from the payload and [`Frame::decode`] reads exactly that many bytes.
/// - Encoded frames never exceed [`FrameHeader::MAX_PAYLOAD_SIZE`] of payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,

    /// Raw payload bytes (CBOR-encoded)
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame, stamping the header's payload size from `payload`.
    ///
    /// Oversized payloads are accepted here and rejected by [`Frame::encode`].
    #[must_use]
    pub fn new(mut header: FrameHeader, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();

        // Lengths past u32::MAX saturate; encode rejects them anyway.
        let payload_len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        header.payload_size = payload_len.to_be_bytes();

        Self { header, payload }
    }

    /// Write `[header][payload]` into `dst`.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTooLarge` if the payload exceeds the cap
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        if self.payload.len() > FrameHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                max: FrameHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        debug_assert_eq!(self.payload.len(), self.header.payload_size() as usize);

        dst.put_slice(&self.header.to_bytes());
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Encode into a fresh buffer.
    ///
    /// # Errors
    ///
    /// Same as [`Frame::encode`].
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(FrameHeader::SIZE + self.payload.len());
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Parse one frame from the front of `bytes`.
    ///
    /// The payload is copied but not deserialized; use
    /// [`crate::Payload::from_frame`] for the typed view. Trailing bytes are
    /// ignored.
    ///
    /// # Errors
    ///
    /// - Any header error from [`FrameHeader::from_bytes`]
    /// - `ProtocolError::FrameTruncated` if fewer payload bytes than claimed
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = FrameHeader::from_bytes(bytes)?;
        let payload_size = header.payload_size() as usize;
        let total_size = FrameHeader::SIZE + payload_size;

        let payload = bytes.get(FrameHeader::SIZE..total_size).ok_or(
            ProtocolError::FrameTruncated {
                expected: payload_size,
                actual: bytes.len().saturating_sub(FrameHeader::SIZE),
            },
        )?;

        Ok(Self { header: *header, payload: Bytes::copy_from_slice(payload) })
    }

    /// Total encoded length of the frame whose header starts `bytes`.
    ///
    /// Used by stream readers to know how much to buffer before calling
    /// [`Frame::decode`].
    ///
    /// # Errors
    ///
    /// Any header error from [`FrameHeader::from_bytes`].
    pub fn encoded_len(bytes: &[u8]) -> Result<usize> {
        let header = FrameHeader::from_bytes(bytes)?;
        Ok(FrameHeader::SIZE + header.payload_size() as usize)
    }
}
