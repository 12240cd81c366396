//! Fuzz target for Envelope::decode
//!
//! This fuzzer tests envelope decoding with arbitrary byte sequences to
//! find:
//! - Parser crashes or panics
//! - Integer overflows in varint handling
//! - Buffer over-reads around the presence-flagged KEM ciphertext
//!
//! The fuzzer should NEVER panic. All invalid inputs should return an
//! error; inputs that decode must re-encode to a decodable buffer.

#![no_main]

use dices_proto::Envelope;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(envelope) = Envelope::decode(data) else {
        return;
    };

    // Anything that decodes must round-trip.
    let wire = envelope.encode_to_vec();
    let again = Envelope::decode(&wire).expect("re-encoded envelope must decode");
    assert_eq!(again, envelope);
});
