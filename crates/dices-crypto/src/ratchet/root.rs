//! Root chain: hybrid DH + ML-KEM ratchet over the per-direction chains

use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::{
    error::CryptoError,
    kem::{self, ENCAPSULATION_KEY_SIZE, KemCiphertext},
    prekeys::PreKeysPublic,
    ratchet::{KeyChain, derive_root_key},
};

/// X25519 public key size in bytes
const DH_PUBLIC_KEY_SIZE: usize = 32;

/// Top-level ratchet state for one peer pair.
///
/// Owns the root key, the current local DH keypair, the last-seen remote DH
/// public key, and one [`KeyChain`] per direction. The root key only changes
/// through [`derive_root_key`], driven by either a DH ratchet (inbound remote
/// key change) or a hybrid ML-KEM ratchet (scheduled rekey against a fresh
/// remote pre-key bundle).
#[derive(Clone, Serialize, Deserialize)]
pub struct RootChain {
    root_key: [u8; 32],
    dh_secret_key: [u8; 32],
    remote_dh_public_key: [u8; 32],
    sending_chain: KeyChain,
    receiving_chain: KeyChain,
}

impl RootChain {
    /// Assemble a root chain from already-derived parts.
    pub fn new(
        root_key: [u8; 32],
        dh_secret_key: [u8; 32],
        remote_dh_public_key: [u8; 32],
        sending_chain: KeyChain,
        receiving_chain: KeyChain,
    ) -> Self {
        Self { root_key, dh_secret_key, remote_dh_public_key, sending_chain, receiving_chain }
    }

    /// Public half of the current local DH keypair.
    pub fn dh_public_key(&self) -> [u8; 32] {
        PublicKey::from(&StaticSecret::from(self.dh_secret_key)).to_bytes()
    }

    /// Remote DH public key this chain last ratcheted against.
    pub fn remote_dh_public_key(&self) -> &[u8; 32] {
        &self.remote_dh_public_key
    }

    /// Chain producing message keys for outbound messages.
    pub fn sending_chain(&self) -> &KeyChain {
        &self.sending_chain
    }

    /// Mutable access to the sending chain (advanced once per sent message).
    pub fn sending_chain_mut(&mut self) -> &mut KeyChain {
        &mut self.sending_chain
    }

    /// Chain producing message keys for inbound messages.
    pub fn receiving_chain(&self) -> &KeyChain {
        &self.receiving_chain
    }

    /// Mutable access to the receiving chain (advanced once per consumed
    /// position).
    pub fn receiving_chain_mut(&mut self) -> &mut KeyChain {
        &mut self.receiving_chain
    }

    /// Ratchet both directions against a new remote DH public key.
    ///
    /// Two-phase derivation: the receiving chain comes from DH between the
    /// current local secret and the new remote key, then a fresh local
    /// keypair is generated and the sending chain comes from DH between that
    /// new secret and the same remote key. The two chains end up keyed
    /// independently, and both reset to message number 0.
    ///
    /// # Errors
    ///
    /// - `SameRemoteKey` if `remote_dh_public_key` equals the key already
    ///   stored; a no-op ratchet would silently reuse chain keys
    pub fn perform_dh_ratchet(
        &mut self,
        remote_dh_public_key: &[u8; 32],
        rng: &mut impl CryptoRngCore,
    ) -> Result<(), CryptoError> {
        if *remote_dh_public_key == self.remote_dh_public_key {
            return Err(CryptoError::SameRemoteKey);
        }

        let remote = PublicKey::from(*remote_dh_public_key);

        let receiving_shared =
            StaticSecret::from(self.dh_secret_key).diffie_hellman(&remote);
        let (intermediate_root, receiving_chain_key) =
            derive_root_key(&self.root_key, receiving_shared.as_bytes(), None);

        let new_secret = StaticSecret::random_from_rng(&mut *rng);
        let sending_shared = new_secret.diffie_hellman(&remote);
        let (final_root, sending_chain_key) =
            derive_root_key(&intermediate_root, sending_shared.as_bytes(), None);

        self.root_key.zeroize();
        self.root_key = final_root;
        self.dh_secret_key.zeroize();
        self.dh_secret_key = new_secret.to_bytes();
        self.remote_dh_public_key = *remote_dh_public_key;
        self.sending_chain = KeyChain::initialized(sending_chain_key);
        self.receiving_chain = KeyChain::initialized(receiving_chain_key);

        Ok(())
    }

    /// Hybrid rekey against a fresh remote pre-key bundle.
    ///
    /// Encapsulates against the bundle's ML-KEM key, generates a fresh local
    /// DH keypair, and folds both secrets into the root key to re-derive the
    /// sending chain. The receiving chain resets to uninitialized: nothing
    /// can be decrypted until the peer's next message triggers a DH ratchet.
    ///
    /// Returns the KEM ciphertext to embed in the outgoing envelope.
    ///
    /// # Errors
    ///
    /// - `InvalidKeyLength` unless the bundle's `encryption_key` is exactly
    ///   1568 bytes and its `dh_public_key` exactly 32 bytes
    pub fn perform_ml_kem_ratchet(
        &mut self,
        remote_keys: &PreKeysPublic,
        rng: &mut impl CryptoRngCore,
    ) -> Result<Box<KemCiphertext>, CryptoError> {
        if remote_keys.encryption_key.len() != ENCAPSULATION_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                field: "encryptionKey",
                expected: ENCAPSULATION_KEY_SIZE,
                actual: remote_keys.encryption_key.len(),
            });
        }
        let remote_dh: [u8; 32] = remote_keys.dh_public_key.as_slice().try_into().map_err(
            |_| CryptoError::InvalidKeyLength {
                field: "dhPublicKey",
                expected: DH_PUBLIC_KEY_SIZE,
                actual: remote_keys.dh_public_key.len(),
            },
        )?;

        let (kem_ciphertext, mut kem_shared) =
            kem::encapsulate(&remote_keys.encryption_key, rng)?;

        let new_secret = StaticSecret::random_from_rng(&mut *rng);
        let dh_shared = new_secret.diffie_hellman(&PublicKey::from(remote_dh));
        let (new_root, sending_chain_key) =
            derive_root_key(&self.root_key, dh_shared.as_bytes(), Some(&kem_shared));
        kem_shared.zeroize();

        self.root_key.zeroize();
        self.root_key = new_root;
        self.dh_secret_key.zeroize();
        self.dh_secret_key = new_secret.to_bytes();
        self.remote_dh_public_key = remote_dh;
        self.sending_chain = KeyChain::initialized(sending_chain_key);
        self.receiving_chain = KeyChain::uninitialized();

        Ok(kem_ciphertext)
    }
}

impl Drop for RootChain {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.dh_secret_key.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::prekeys::PreKeys;

    fn chain_pair(rng: &mut StdRng) -> (RootChain, RootChain) {
        // Hand-build two converged chains the way a completed handshake
        // would leave them: shared root key, opposite chain assignments.
        let alice_secret = StaticSecret::random_from_rng(&mut *rng);
        let bob_secret = StaticSecret::random_from_rng(&mut *rng);
        let alice_public = PublicKey::from(&alice_secret).to_bytes();
        let bob_public = PublicKey::from(&bob_secret).to_bytes();

        let shared = alice_secret.diffie_hellman(&PublicKey::from(bob_public));
        let (root, chain_key) = derive_root_key(&[0u8; 32], shared.as_bytes(), None);

        let alice = RootChain::new(
            root,
            alice_secret.to_bytes(),
            bob_public,
            KeyChain::initialized(chain_key),
            KeyChain::uninitialized(),
        );
        let bob = RootChain::new(
            root,
            bob_secret.to_bytes(),
            alice_public,
            KeyChain::uninitialized(),
            KeyChain::initialized(chain_key),
        );
        (alice, bob)
    }

    #[test]
    fn dh_ratchet_rejects_same_remote_key() {
        let mut rng = StdRng::seed_from_u64(1);
        let (mut alice, _bob) = chain_pair(&mut rng);

        let current = *alice.remote_dh_public_key();
        assert_eq!(alice.perform_dh_ratchet(&current, &mut rng), Err(CryptoError::SameRemoteKey));
    }

    #[test]
    fn dh_ratchet_converges_between_peers() {
        let mut rng = StdRng::seed_from_u64(2);
        let (mut alice, mut bob) = chain_pair(&mut rng);

        // Bob ratchets against Alice's current key, then Alice ratchets
        // against Bob's new key: Bob's sending chain must match Alice's
        // receiving chain.
        let alice_public = alice.dh_public_key();
        bob.perform_dh_ratchet(&alice_public, &mut rng).unwrap();
        alice.perform_dh_ratchet(&bob.dh_public_key(), &mut rng).unwrap();

        let bob_send = bob.sending_chain().secret().unwrap().to_bytes();
        let alice_recv = alice.receiving_chain().secret().unwrap().to_bytes();
        assert_eq!(bob_send, alice_recv, "peers must converge on the same chain key");
    }

    #[test]
    fn dh_ratchet_resets_message_numbers() {
        let mut rng = StdRng::seed_from_u64(3);
        let (mut alice, mut bob) = chain_pair(&mut rng);

        alice.sending_chain_mut().next().unwrap();
        alice.sending_chain_mut().next().unwrap();

        let alice_public = alice.dh_public_key();
        bob.perform_dh_ratchet(&alice_public, &mut rng).unwrap();
        alice.perform_dh_ratchet(&bob.dh_public_key(), &mut rng).unwrap();

        assert_eq!(alice.sending_chain().message_number(), 0);
        assert_eq!(alice.receiving_chain().message_number(), 0);
    }

    #[test]
    fn dh_ratchet_replaces_local_keypair() {
        let mut rng = StdRng::seed_from_u64(4);
        let (mut alice, bob) = chain_pair(&mut rng);

        let before = alice.dh_public_key();
        alice.perform_dh_ratchet(&bob.dh_public_key(), &mut rng).unwrap();
        assert_ne!(alice.dh_public_key(), before);
    }

    #[test]
    fn ml_kem_ratchet_rejects_bad_encryption_key_length() {
        let mut rng = StdRng::seed_from_u64(5);
        let (mut alice, _bob) = chain_pair(&mut rng);

        let bundle = PreKeysPublic {
            key_id: [0u8; 8],
            encryption_key: vec![0u8; 42],
            dh_public_key: vec![0u8; 32],
        };
        assert!(matches!(
            alice.perform_ml_kem_ratchet(&bundle, &mut rng),
            Err(CryptoError::InvalidKeyLength { field: "encryptionKey", expected: 1568, actual: 42 })
        ));
    }

    #[test]
    fn ml_kem_ratchet_rejects_bad_dh_key_length() {
        let mut rng = StdRng::seed_from_u64(6);
        let (mut alice, _bob) = chain_pair(&mut rng);

        let bundle = PreKeysPublic {
            key_id: [0u8; 8],
            encryption_key: vec![0u8; ENCAPSULATION_KEY_SIZE],
            dh_public_key: vec![0u8; 31],
        };
        assert!(matches!(
            alice.perform_ml_kem_ratchet(&bundle, &mut rng),
            Err(CryptoError::InvalidKeyLength { field: "dhPublicKey", expected: 32, actual: 31 })
        ));
    }

    #[test]
    fn ml_kem_ratchet_resets_receiving_chain() {
        let mut rng = StdRng::seed_from_u64(7);
        let (_alice, mut bob) = chain_pair(&mut rng);
        let remote = PreKeys::generate(&mut rng);

        let ciphertext = bob.perform_ml_kem_ratchet(&remote.public(), &mut rng).unwrap();

        assert_eq!(ciphertext.len(), 1568);
        assert!(bob.sending_chain().is_initialized());
        assert!(!bob.receiving_chain().is_initialized());
        assert_eq!(bob.remote_dh_public_key(), &remote.dh_public_key());
    }
}
