//! Protocol error types for envelope encoding and decoding.

use thiserror::Error;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors from envelope wire parsing and signing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer does not start with the DICES magic bytes
    #[error("invalid magic bytes")]
    InvalidMagic,

    /// Version byte is not a supported protocol version
    ///
    /// At the transport boundary these buffers are dropped silently (see
    /// the overlay's buffer handler); this error only surfaces when a
    /// caller explicitly decodes a buffer it already committed to.
    #[error("unsupported protocol version: {0:#04x}")]
    UnsupportedVersion(u8),

    /// Buffer ended before a fixed-size field was complete
    #[error("envelope truncated while reading {field}: needed {needed} bytes, had {available}")]
    Truncated {
        /// Field being read when the buffer ran out
        field: &'static str,
        /// Bytes required by the field
        needed: usize,
        /// Bytes remaining in the buffer
        available: usize,
    },

    /// Variable-length integer exceeded 64 bits
    #[error("varint overflow while reading {field}")]
    VarIntOverflow {
        /// Field being read when the overflow occurred
        field: &'static str,
    },

    /// KEM ciphertext presence flag was neither 0 nor 1
    #[error("invalid presence flag {value:#04x} for {field}")]
    InvalidPresenceFlag {
        /// Field the flag belongs to
        field: &'static str,
        /// Flag byte found on the wire
        value: u8,
    },

    /// Signing or public-key recovery failed
    #[error("signature error: {0}")]
    Signature(#[from] dices_crypto::CryptoError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::Truncated { field: "dhPublicKey", needed: 32, available: 7 };
        assert_eq!(
            err.to_string(),
            "envelope truncated while reading dhPublicKey: needed 32 bytes, had 7"
        );
    }

    #[test]
    fn version_renders_hex() {
        assert_eq!(ProtocolError::UnsupportedVersion(0x02).to_string(), "unsupported protocol version: 0x02");
    }
}
