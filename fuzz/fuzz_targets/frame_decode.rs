//! Fuzz target for `Frame::decode` and `Frame::encoded_len`.
//!
//! Arbitrary bytes must never panic the parser; they either decode or fail
//! with an error. A frame that decodes must report a length no larger than
//! the input and survive a re-encode unchanged.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tether_proto::Frame;

fuzz_target!(|data: &[u8]| {
    let len = Frame::encoded_len(data);

    if let Ok(frame) = Frame::decode(data) {
        let total = len.expect("decodable frame has a length");
        assert!(total <= data.len());

        let encoded = frame.to_vec().expect("decoded frame re-encodes");
        assert_eq!(&encoded[..], &data[..total]);
    }
});
