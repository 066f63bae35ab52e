//! Fuzz target for CBOR payload decoding.
//!
//! Wraps arbitrary bytes in a valid header for every opcode, so the CBOR
//! layer sees malformed input, type confusion (a payload shaped for another
//! opcode) and oversized claimed lengths. Decoding must fail cleanly.

#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use tether_proto::{Frame, FrameHeader, Opcode, Payload};

const OPCODES: [Opcode; 6] = [
    Opcode::Connect,
    Opcode::Connected,
    Opcode::Goodbye,
    Opcode::Event,
    Opcode::SendMessage,
    Opcode::Error,
];

fuzz_target!(|data: &[u8]| {
    for opcode in OPCODES {
        let frame = Frame::new(FrameHeader::new(opcode), Bytes::copy_from_slice(data));
        if let Ok(payload) = Payload::from_frame(&frame) {
            assert_eq!(payload.opcode(), opcode);
        }
    }
});
