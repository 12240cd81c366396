//! Envelope payload encryption using XChaCha20-Poly1305

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use rand_core::CryptoRngCore;

use crate::error::CryptoError;

/// Size of the XChaCha20 nonce (24 bytes)
pub const NONCE_SIZE: usize = 24;

/// Poly1305 tag size (16 bytes)
const POLY1305_TAG_SIZE: usize = 16;

/// An AEAD-protected payload: random nonce plus ciphertext-with-tag.
///
/// Treated as opaque by everything except the ratchet that holds the
/// 32-byte message key. The nonce is random rather than derived: message
/// keys are single-use, so uniqueness per key is already guaranteed and
/// the random nonce keeps identical plaintexts unlinkable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherData {
    /// The 24-byte XChaCha20 nonce
    pub nonce: [u8; NONCE_SIZE],
    /// The ciphertext including the 16-byte Poly1305 tag
    pub data: Vec<u8>,
}

impl CipherData {
    /// Encrypt `plaintext` under a 32-byte message key.
    ///
    /// # Security
    ///
    /// - Caller MUST provide a cryptographically secure RNG in production
    /// - The message key must come from a chain position consumed exactly
    ///   once
    pub fn encrypt(key: &[u8; 32], plaintext: &[u8], rng: &mut impl CryptoRngCore) -> Self {
        let mut nonce = [0u8; NONCE_SIZE];
        rng.fill_bytes(&mut nonce);

        let cipher = XChaCha20Poly1305::new(key.into());
        let Ok(data) = cipher.encrypt(XNonce::from_slice(&nonce), plaintext) else {
            unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
        };

        Self { nonce, data }
    }

    /// Decrypt the payload under a 32-byte message key.
    ///
    /// # Errors
    ///
    /// - `DecryptionFailed` if the authentication tag or key is incorrect
    ///   (tampering or chain desynchronization)
    pub fn decrypt(&self, key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new(key.into());
        cipher.decrypt(XNonce::from_slice(&self.nonce), self.data.as_slice()).map_err(|_| {
            CryptoError::DecryptionFailed { reason: "authentication failed".to_string() }
        })
    }

    /// Plaintext length (ciphertext length minus authentication tag).
    pub fn plaintext_len(&self) -> usize {
        self.data.len().saturating_sub(POLY1305_TAG_SIZE)
    }
}
