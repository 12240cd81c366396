//! DICES Wire Protocol
//!
//! Binary codec for the signed envelope exchanged between peers. This crate
//! is deliberately small: it owns the field layout, the varint encoding,
//! and the signed-hash construction, and nothing about session state.
//!
//! Layering:
//!
//! ```text
//! dices-core    session state machine, orchestration
//!      │
//! dices-proto   envelope codec, signing, sender recovery   (this crate)
//!      │
//! dices-crypto  ratchet, AEAD, identity primitives
//! ```
//!
//! # Security
//!
//! Structural validity only: [`Envelope::decode`] guarantees field layout
//! and lengths, NOT authenticity or freshness. Callers must recover the
//! sender via [`Envelope::recover_node_id`] and compare it against the
//! expected peer before trusting anything inside.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod envelope;
mod errors;
mod varint;

pub use envelope::{Envelope, EnvelopeFields, MAGIC_BYTES, VERSION, is_supported_buffer};
pub use errors::{ProtocolError, Result};
pub use varint::{MAX_VARINT_LEN, get_varint, put_varint};
