//! Single-direction symmetric ratchet producing per-message keys
//!
//! # Security Properties
//!
//! - Forward Secrecy: old chain keys are overwritten when advancing
//! - Key Uniqueness: each position produces a unique message key
//! - Determinism: same chain key always produces the same key sequence

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Label for deriving the next chain key
const CHAIN_LABEL: &[u8] = b"chain";

/// Label for deriving a message key
const MESSAGE_LABEL: &[u8] = b"message";

/// A message key derived from a key chain.
///
/// Used for a single AEAD encryption or decryption and then discarded.
#[derive(Clone)]
pub struct MessageKey {
    /// The 32-byte symmetric key for XChaCha20-Poly1305
    key: [u8; 32],
}

impl MessageKey {
    /// 32-byte symmetric key for XChaCha20-Poly1305 AEAD.
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Copy out the raw key bytes.
    ///
    /// Only for caching a skipped key that must outlive this value; the
    /// caller takes over the responsibility of discarding the copy.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.key
    }
}

impl From<[u8; 32]> for MessageKey {
    fn from(key: [u8; 32]) -> Self {
        Self { key }
    }
}

// Implement Drop to zeroize key material
impl Drop for MessageKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Forward-secure per-direction key chain.
///
/// A chain starts uninitialized (the initiator's receiving chain stays that
/// way until the first inbound DH ratchet) or initialized with a chain key
/// produced by the root chain. [`secret()`](Self::secret) derives the message
/// key for the current position without side effects; [`next()`](Self::next)
/// consumes the position by replacing the chain key with a one-way derivation
/// of itself.
///
/// # Security
///
/// - `next()` overwrites the chain key, making the previous message key
///   unrecoverable from the new state
/// - `secret()` is repeatable until `next()` is called, which the decrypt
///   path relies on when caching skipped keys
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyChain {
    /// Current chain key; `None` until the first ratchet event for this
    /// direction
    chain_key: Option<[u8; 32]>,
    /// Position of the next message in this chain
    message_number: u64,
}

impl KeyChain {
    /// Create a chain with a live chain key at position 0.
    pub fn initialized(chain_key: [u8; 32]) -> Self {
        Self { chain_key: Some(chain_key), message_number: 0 }
    }

    /// Create a chain with no key material.
    ///
    /// Deriving or advancing an uninitialized chain fails with
    /// [`CryptoError::UninitializedChain`].
    pub fn uninitialized() -> Self {
        Self { chain_key: None, message_number: 0 }
    }

    /// Whether this chain has a live chain key.
    pub fn is_initialized(&self) -> bool {
        self.chain_key.is_some()
    }

    /// Position of the next message in this chain.
    pub fn message_number(&self) -> u64 {
        self.message_number
    }

    /// Derive the message key for the current position.
    ///
    /// Deterministic and side-effect free: repeated calls return the same
    /// key until [`next()`](Self::next) advances the chain.
    ///
    /// # Errors
    ///
    /// - `UninitializedChain` if no chain key is set
    pub fn secret(&self) -> Result<MessageKey, CryptoError> {
        let chain_key = self.chain_key.as_ref().ok_or(CryptoError::UninitializedChain)?;
        Ok(MessageKey { key: derive(chain_key, MESSAGE_LABEL) })
    }

    /// Advance the chain past the current position.
    ///
    /// Replaces the chain key with `HMAC(chain_key, "chain")` and increments
    /// the message number. Must be called exactly once per consumed position,
    /// after the message key for that position has been used; afterwards the
    /// previous message key cannot be re-derived.
    ///
    /// # Errors
    ///
    /// - `UninitializedChain` if no chain key is set
    pub fn next(&mut self) -> Result<(), CryptoError> {
        let mut chain_key = self.chain_key.take().ok_or(CryptoError::UninitializedChain)?;
        self.chain_key = Some(derive(&chain_key, CHAIN_LABEL));
        chain_key.zeroize();
        self.message_number = self.message_number.wrapping_add(1);
        Ok(())
    }
}

impl Drop for KeyChain {
    fn drop(&mut self) {
        self.chain_key.zeroize();
    }
}

/// One HMAC-SHA256 derivation step over the chain key.
fn derive(chain_key: &[u8; 32], label: &[u8]) -> [u8; 32] {
    let Ok(mut mac) = HmacSha256::new_from_slice(chain_key) else {
        unreachable!("HMAC-SHA256 accepts any key size");
    };
    mac.update(label);
    let result = mac.finalize().into_bytes();

    let mut key = [0u8; 32];
    key.copy_from_slice(&result);
    key
}
