//! Fuzz target for the LEB128 varint codec
//!
//! - Arbitrary buffers must decode without panicking
//! - Every u64 must survive an encode/decode round trip

#![no_main]

use arbitrary::Arbitrary;
use dices_proto::{get_varint, put_varint};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    value: u64,
    raw: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let mut buf = Vec::new();
    put_varint(&mut buf, input.value);
    let (decoded, consumed) = get_varint(&buf, "fuzz").expect("encoded varint must decode");
    assert_eq!(decoded, input.value);
    assert_eq!(consumed, buf.len());

    // Arbitrary bytes: errors allowed, panics are not.
    let _ = get_varint(&input.raw, "fuzz");
});
