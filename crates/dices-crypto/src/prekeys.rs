//! Hybrid X25519 + ML-KEM-1024 pre-keys
//!
//! A pre-key bundle is the long-term-ish material a peer publishes so that
//! strangers can initiate a session without prior contact: an X25519
//! keypair for the DH half and an ML-KEM-1024 keypair for the post-quantum
//! half. The bundle is identified by a deterministic 8-byte key id derived
//! from its public halves.

use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::kem::{self, KEM_SEED_SIZE, KemCiphertext};

/// Pre-key bundle identifier size in bytes
pub const KEY_ID_SIZE: usize = 8;

/// Deterministic identifier of a pre-key bundle.
pub type KeyId = [u8; KEY_ID_SIZE];

/// Derive a bundle's key id from its public halves.
///
/// Truncated SHA-256 of `encryption_key ‖ dh_public_key`: collision-resistant
/// enough for an 8-byte namespace of concurrently-live bundles, and both
/// peers derive the same id from the published keys alone.
pub fn derive_key_id(encryption_key: &[u8], dh_public_key: &[u8]) -> KeyId {
    let mut hasher = Sha256::new();
    hasher.update(encryption_key);
    hasher.update(dh_public_key);
    let digest = hasher.finalize();

    let mut key_id = [0u8; KEY_ID_SIZE];
    key_id.copy_from_slice(&digest[..KEY_ID_SIZE]);
    key_id
}

/// Public projection of a pre-key bundle, as published for discovery.
///
/// Field lengths are deliberately unchecked here: this is what arrives from
/// the DHT, and the ratchet validates lengths before use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeysPublic {
    /// Deterministic bundle identifier
    pub key_id: KeyId,
    /// ML-KEM-1024 encapsulation key (1568 bytes when well-formed)
    pub encryption_key: Vec<u8>,
    /// X25519 public key (32 bytes when well-formed)
    pub dh_public_key: Vec<u8>,
}

/// A local hybrid pre-key bundle: both keypairs plus the derived key id.
///
/// The ML-KEM keypair is expanded from its 64-byte seed on construction;
/// only the seed and the X25519 secret need persisting.
#[derive(Clone)]
pub struct PreKeys {
    dh_secret_key: [u8; 32],
    dh_public_key: [u8; 32],
    ml_kem_seed: [u8; KEM_SEED_SIZE],
    encryption_key: Box<[u8; kem::ENCAPSULATION_KEY_SIZE]>,
    key_id: KeyId,
}

impl PreKeys {
    /// Generate a bundle from fresh random seeds.
    pub fn generate(rng: &mut impl CryptoRngCore) -> Self {
        let dh_secret_key = StaticSecret::random_from_rng(&mut *rng).to_bytes();
        let mut ml_kem_seed = [0u8; KEM_SEED_SIZE];
        rng.fill_bytes(&mut ml_kem_seed);
        Self::from_seeds(dh_secret_key, ml_kem_seed)
    }

    /// Expand a bundle from explicit seeds.
    ///
    /// Deterministic: persisted bundles are rehydrated through this
    /// constructor and reproduce the same key material and key id.
    pub fn from_seeds(dh_secret_key: [u8; 32], ml_kem_seed: [u8; KEM_SEED_SIZE]) -> Self {
        let dh_public_key = PublicKey::from(&StaticSecret::from(dh_secret_key)).to_bytes();

        let encryption_key = kem::encryption_key_from_seed(&ml_kem_seed);
        let key_id = derive_key_id(encryption_key.as_slice(), &dh_public_key);

        Self { dh_secret_key, dh_public_key, ml_kem_seed, encryption_key, key_id }
    }

    /// Deterministic bundle identifier.
    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    /// X25519 public key.
    pub fn dh_public_key(&self) -> [u8; 32] {
        self.dh_public_key
    }

    /// X25519 secret key bytes (for persistence by the caller).
    pub fn dh_secret_bytes(&self) -> [u8; 32] {
        self.dh_secret_key
    }

    /// ML-KEM seed bytes (for persistence by the caller).
    pub fn ml_kem_seed(&self) -> &[u8; KEM_SEED_SIZE] {
        &self.ml_kem_seed
    }

    /// ML-KEM-1024 encapsulation key.
    pub fn encryption_key(&self) -> &[u8; kem::ENCAPSULATION_KEY_SIZE] {
        &self.encryption_key
    }

    /// Public projection for publication and discovery.
    pub fn public(&self) -> PreKeysPublic {
        PreKeysPublic {
            key_id: self.key_id,
            encryption_key: self.encryption_key.to_vec(),
            dh_public_key: self.dh_public_key.to_vec(),
        }
    }

    /// X25519 shared secret between this bundle's static secret and a
    /// remote public key.
    pub fn dh_shared_secret(&self, remote_public_key: &[u8; 32]) -> [u8; 32] {
        let shared = StaticSecret::from(self.dh_secret_key)
            .diffie_hellman(&PublicKey::from(*remote_public_key));
        *shared.as_bytes()
    }

    /// Decapsulate a KEM ciphertext addressed to this bundle.
    pub fn decapsulate(&self, ciphertext: &KemCiphertext) -> [u8; 32] {
        kem::decapsulate(&self.ml_kem_seed, ciphertext)
    }
}

impl std::fmt::Debug for PreKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreKeys").field("key_id", &self.key_id).finish_non_exhaustive()
    }
}

impl Drop for PreKeys {
    fn drop(&mut self) {
        self.dh_secret_key.zeroize();
        self.ml_kem_seed.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    #[test]
    fn from_seeds_is_deterministic() {
        let a = PreKeys::from_seeds([1u8; 32], [2u8; KEM_SEED_SIZE]);
        let b = PreKeys::from_seeds([1u8; 32], [2u8; KEM_SEED_SIZE]);

        assert_eq!(a.key_id(), b.key_id());
        assert_eq!(a.dh_public_key(), b.dh_public_key());
        assert_eq!(a.encryption_key()[..], b.encryption_key()[..]);
    }

    #[test]
    fn generated_bundles_are_distinct() {
        let mut rng = StdRng::seed_from_u64(1);
        let a = PreKeys::generate(&mut rng);
        let b = PreKeys::generate(&mut rng);

        assert_ne!(a.key_id(), b.key_id());
        assert_ne!(a.dh_public_key(), b.dh_public_key());
    }

    #[test]
    fn key_id_binds_both_public_halves() {
        let base = PreKeys::from_seeds([1u8; 32], [2u8; KEM_SEED_SIZE]);
        let other_dh = PreKeys::from_seeds([3u8; 32], [2u8; KEM_SEED_SIZE]);
        let other_kem = PreKeys::from_seeds([1u8; 32], [4u8; KEM_SEED_SIZE]);

        assert_ne!(base.key_id(), other_dh.key_id());
        assert_ne!(base.key_id(), other_kem.key_id());
    }

    #[test]
    fn public_projection_matches_bundle() {
        let bundle = PreKeys::from_seeds([5u8; 32], [6u8; KEM_SEED_SIZE]);
        let public = bundle.public();

        assert_eq!(public.key_id, bundle.key_id());
        assert_eq!(public.encryption_key.len(), kem::ENCAPSULATION_KEY_SIZE);
        assert_eq!(public.dh_public_key, bundle.dh_public_key().to_vec());
        assert_eq!(public.key_id, derive_key_id(&public.encryption_key, &public.dh_public_key));
    }

    #[test]
    fn encapsulate_to_public_decapsulates_with_bundle() {
        let mut rng = StdRng::seed_from_u64(2);
        let bundle = PreKeys::generate(&mut rng);

        let (ciphertext, sender_secret) =
            kem::encapsulate(&bundle.public().encryption_key, &mut rng).unwrap();
        assert_eq!(bundle.decapsulate(&ciphertext), sender_secret);
    }

    #[test]
    fn dh_shared_secret_agrees_between_peers() {
        let mut rng = StdRng::seed_from_u64(3);
        let bundle = PreKeys::generate(&mut rng);

        let remote_secret = StaticSecret::random_from_rng(&mut rng);
        let remote_public = PublicKey::from(&remote_secret).to_bytes();

        let ours = bundle.dh_shared_secret(&remote_public);
        let theirs = remote_secret.diffie_hellman(&PublicKey::from(bundle.dh_public_key()));

        assert_eq!(&ours, theirs.as_bytes());
    }
}
