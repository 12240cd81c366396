//! Fuzz target for persisted session state deserialization
//!
//! Session records come back from storage as CBOR; a corrupted database
//! must surface a serialization error, never a panic or runaway
//! allocation.

#![no_main]

use dices_core::SessionState;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(state) = SessionState::from_bytes(data) else {
        return;
    };

    // Anything that decodes must re-serialize.
    let bytes = state.to_bytes().expect("decoded state must re-encode");
    let _ = SessionState::from_bytes(&bytes).expect("re-encoded state must decode");
});
