//! ML-KEM-1024 encapsulation for the hybrid ratchet
//!
//! Thin wrapper around the `ml-kem` crate working on raw byte buffers, so
//! the ratchet and pre-key layers never handle the typed KEM objects
//! directly. Key pairs are expanded deterministically from a 64-byte seed,
//! which is what gets persisted.

use ml_kem::{
    Ciphertext, EncodedSizeUser, KemCore, MlKem1024, MlKem1024Params,
    kem::{Decapsulate, DecapsulationKey, Encapsulate, EncapsulationKey},
};
use rand_core::CryptoRngCore;

use crate::error::CryptoError;

/// ML-KEM-1024 encapsulation (public) key size in bytes
pub const ENCAPSULATION_KEY_SIZE: usize = 1568;

/// ML-KEM-1024 ciphertext size in bytes
pub const KEM_CIPHERTEXT_SIZE: usize = 1568;

/// Seed size for deterministic key generation (d ‖ z)
pub const KEM_SEED_SIZE: usize = 64;

/// An ML-KEM-1024 ciphertext as carried in an envelope.
///
/// Boxed at rest: 1568 bytes is too large to keep on the stack inside
/// session state and envelopes.
pub type KemCiphertext = [u8; KEM_CIPHERTEXT_SIZE];

/// Expand an ML-KEM-1024 key pair from a 64-byte seed.
///
/// Deterministic: the same seed always yields the same key pair, which is
/// how persisted pre-keys are rehydrated without storing the expanded
/// decapsulation key.
pub fn keypair_from_seed(
    seed: &[u8; KEM_SEED_SIZE],
) -> (DecapsulationKey<MlKem1024Params>, EncapsulationKey<MlKem1024Params>) {
    let Ok(d) = (&seed[..32]).try_into() else {
        unreachable!("seed halves are exactly 32 bytes");
    };
    let Ok(z) = (&seed[32..]).try_into() else {
        unreachable!("seed halves are exactly 32 bytes");
    };
    MlKem1024::generate_deterministic(&d, &z)
}

/// Encoded encapsulation key for the key pair expanded from `seed`.
pub fn encryption_key_from_seed(seed: &[u8; KEM_SEED_SIZE]) -> Box<[u8; ENCAPSULATION_KEY_SIZE]> {
    let (_, ek) = keypair_from_seed(seed);
    let encoded = ek.as_bytes();

    let mut out = Box::new([0u8; ENCAPSULATION_KEY_SIZE]);
    out.copy_from_slice(&encoded);
    out
}

/// Encapsulate against a remote encapsulation key.
///
/// Returns the ciphertext to transmit and the 32-byte shared secret.
///
/// # Errors
///
/// - `InvalidKeyLength` if `encryption_key` is not exactly 1568 bytes
pub fn encapsulate(
    encryption_key: &[u8],
    rng: &mut impl CryptoRngCore,
) -> Result<(Box<KemCiphertext>, [u8; 32]), CryptoError> {
    let encoded = encryption_key.try_into().map_err(|_| CryptoError::InvalidKeyLength {
        field: "encryptionKey",
        expected: ENCAPSULATION_KEY_SIZE,
        actual: encryption_key.len(),
    })?;
    let ek = EncapsulationKey::<MlKem1024Params>::from_bytes(&encoded);

    let Ok((ciphertext, shared)) = ek.encapsulate(rng) else {
        unreachable!("ML-KEM encapsulation is infallible");
    };

    let mut out = Box::new([0u8; KEM_CIPHERTEXT_SIZE]);
    out.copy_from_slice(&ciphertext);
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&shared);

    Ok((out, secret))
}

/// Decapsulate a ciphertext with the key pair expanded from `seed`.
///
/// ML-KEM uses implicit rejection: malformed ciphertexts of the right
/// length yield an unrelated secret rather than an error, and the AEAD
/// layer rejects the message downstream.
pub fn decapsulate(seed: &[u8; KEM_SEED_SIZE], ciphertext: &KemCiphertext) -> [u8; 32] {
    let (dk, _ek) = keypair_from_seed(seed);

    let Ok(ct) = Ciphertext::<MlKem1024>::try_from(&ciphertext[..]) else {
        unreachable!("ciphertext is exactly 1568 bytes");
    };
    let Ok(shared) = dk.decapsulate(&ct) else {
        unreachable!("ML-KEM decapsulation is infallible");
    };

    let mut secret = [0u8; 32];
    secret.copy_from_slice(&shared);
    secret
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    fn test_seed(fill: u8) -> [u8; KEM_SEED_SIZE] {
        [fill; KEM_SEED_SIZE]
    }

    #[test]
    fn keypair_from_seed_is_deterministic() {
        let (_, ek1) = keypair_from_seed(&test_seed(1));
        let (_, ek2) = keypair_from_seed(&test_seed(1));
        assert_eq!(ek1.as_bytes(), ek2.as_bytes());
    }

    #[test]
    fn different_seeds_produce_different_keys() {
        let (_, ek1) = keypair_from_seed(&test_seed(1));
        let (_, ek2) = keypair_from_seed(&test_seed(2));
        assert_ne!(ek1.as_bytes(), ek2.as_bytes());
    }

    #[test]
    fn encapsulate_decapsulate_agree() {
        let mut rng = StdRng::seed_from_u64(7);
        let seed = test_seed(3);
        let (_, ek) = keypair_from_seed(&seed);

        let (ciphertext, sender_secret) = encapsulate(&ek.as_bytes(), &mut rng).unwrap();
        let receiver_secret = decapsulate(&seed, &ciphertext);

        assert_eq!(sender_secret, receiver_secret);
    }

    #[test]
    fn encapsulate_rejects_wrong_length() {
        let mut rng = StdRng::seed_from_u64(7);
        let result = encapsulate(&[0u8; 100], &mut rng);
        assert_eq!(
            result.map(|_| ()),
            Err(CryptoError::InvalidKeyLength {
                field: "encryptionKey",
                expected: ENCAPSULATION_KEY_SIZE,
                actual: 100,
            })
        );
    }

    #[test]
    fn tampered_ciphertext_yields_different_secret() {
        let mut rng = StdRng::seed_from_u64(9);
        let seed = test_seed(4);
        let (_, ek) = keypair_from_seed(&seed);

        let (mut ciphertext, sender_secret) = encapsulate(&ek.as_bytes(), &mut rng).unwrap();
        ciphertext[0] ^= 0xFF;
        let receiver_secret = decapsulate(&seed, &ciphertext);

        // Implicit rejection: no error, but the secrets no longer match.
        assert_ne!(sender_secret, receiver_secret);
    }
}
