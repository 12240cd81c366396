//! Error types for cryptographic operations

use thiserror::Error;

/// Errors from ratchet, AEAD, and identity operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Chain key requested from a chain that has not been initialized
    #[error("chain key not initialized")]
    UninitializedChain,

    /// DH ratchet invoked with the remote public key already in use
    #[error("DH ratchet invoked with unchanged remote public key")]
    SameRemoteKey,

    /// Key material with an unexpected length
    #[error("invalid {field} length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Which key field failed validation
        field: &'static str,
        /// Expected length in bytes
        expected: usize,
        /// Actual length in bytes
        actual: usize,
    },

    /// AEAD decryption failed (authentication tag mismatch)
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// Reason for decryption failure
        reason: String,
    },

    /// Signature creation or public-key recovery failed
    #[error("signature error: {reason}")]
    Signature {
        /// Reason for signature failure
        reason: String,
    },

    /// Secret scalar outside the valid secp256k1 range
    #[error("invalid secret key")]
    InvalidSecretKey,
}
