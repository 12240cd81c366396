//! DICES Cryptographic Primitives
//!
//! Cryptographic building blocks for the DICES bounded triple ratchet.
//! Pure functions over fixed-size buffers; callers provide random bytes,
//! which enables deterministic testing.
//!
//! # Key Lifecycle
//!
//! Every peer pair shares a root key that is re-derived on each ratchet
//! event. Per-direction key chains hang off the root key and produce one
//! message key per position.
//!
//! ```text
//! X25519 DH secret (‖ ML-KEM-1024 shared secret on rekey)
//!        │
//!        ▼
//! HKDF → Root Key + Chain Key (per ratchet event, per direction)
//!        │
//!        ▼
//! Key Chain (HMAC ratchet) → Message Keys
//!        │
//!        ▼
//! AEAD Encryption → CipherData
//! ```
//!
//! Message keys are used for exactly one AEAD operation. Advancing a chain
//! overwrites the previous chain key, so past messages remain secure even
//! if the current state is compromised.
//!
//! # Security
//!
//! Forward Secrecy:
//! - Chain advancement: old chain keys are zeroized after deriving the next
//! - DH ratchet: fresh ephemeral keypair on every remote key change
//! - KEM ratchet: ML-KEM-1024 encapsulation folds a post-quantum secret
//!   into the root key on scheduled rekeys
//!
//! Authenticity:
//! - XChaCha20-Poly1305 AEAD rejects tampered ciphertext
//! - secp256k1 recoverable signatures bind every envelope to a sender
//!   identity; the node id is derived from the recovered public key, so
//!   there is no separate signer field to forge

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod aead;
pub mod dh;
pub mod error;
pub mod identity;
pub mod kem;
pub mod prekeys;
pub mod ratchet;

pub use aead::{CipherData, NONCE_SIZE};
pub use error::CryptoError;
pub use identity::{Keys, NodeId, RSignature, RatchetId, ratchet_id};
pub use kem::{ENCAPSULATION_KEY_SIZE, KEM_CIPHERTEXT_SIZE, KEM_SEED_SIZE, KemCiphertext};
pub use prekeys::{KEY_ID_SIZE, KeyId, PreKeys, PreKeysPublic, derive_key_id};
pub use ratchet::{KeyChain, MessageKey, RootChain, derive_root_key};
