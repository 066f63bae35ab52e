//! Property tests for frame decoding.
//!
//! Decoding must never panic on arbitrary input and must reject any buffer
//! that stops short of the length its header claims.

use bytes::Bytes;
use proptest::prelude::*;
use tether_proto::{ChatEvent, Frame, FrameHeader, Opcode, Payload, ProtocolError};

fn arbitrary_opcode() -> impl Strategy<Value = Opcode> {
    prop_oneof![
        Just(Opcode::Connect),
        Just(Opcode::Connected),
        Just(Opcode::Goodbye),
        Just(Opcode::Event),
        Just(Opcode::SendMessage),
        Just(Opcode::Error),
    ]
}

fn arbitrary_frame() -> impl Strategy<Value = Frame> {
    (arbitrary_opcode(), prop::collection::vec(any::<u8>(), 0..512))
        .prop_map(|(opcode, payload)| Frame::new(FrameHeader::new(opcode), Bytes::from(payload)))
}

proptest! {
    #[test]
    fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = Frame::decode(&bytes);
    }

    #[test]
    fn payload_decode_never_panics(
        opcode in arbitrary_opcode(),
        bytes in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let _ = Payload::decode(opcode, &bytes);
    }

    #[test]
    fn truncated_frames_are_rejected(frame in arbitrary_frame(), cut in any::<prop::sample::Index>()) {
        let wire = frame.to_vec().unwrap();
        let len = cut.index(wire.len());

        let result = Frame::decode(&wire[..len]);
        if len < FrameHeader::SIZE {
            let is_too_short = matches!(result, Err(ProtocolError::FrameTooShort { .. }));
            prop_assert!(is_too_short);
        } else {
            let is_truncated = matches!(result, Err(ProtocolError::FrameTruncated { .. }));
            prop_assert!(is_truncated);
        }
    }

    #[test]
    fn encoded_frames_decode_to_themselves(frame in arbitrary_frame()) {
        let wire = frame.to_vec().unwrap();
        prop_assert_eq!(Frame::decode(&wire).unwrap(), frame);
    }
}

#[test]
fn event_survives_the_wire() {
    let mut event = ChatEvent::new("message.new", Some("messaging:general".into()), 1_700_000_000_000);
    event.body = vec![0xDE, 0xAD];

    let wire = Payload::Event(event.clone()).to_wire().unwrap();
    let frame = Frame::decode(&wire).unwrap();

    assert_eq!(Payload::from_frame(&frame).unwrap(), Payload::Event(event));
}

#[test]
fn health_check_is_recognized() {
    assert!(ChatEvent::health_check(0).is_health_check());
    assert!(!ChatEvent::new("message.new", None, 0).is_health_check());
}
