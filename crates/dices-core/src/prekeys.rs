//! Persisted pre-key bundle records
//!
//! Wraps the cryptographic pre-key bundle with its storage lifecycle:
//! records are created locally, published via discovery, marked rotated
//! (not deleted) when superseded, and pruned by the overlay's TTL sweep.
//! Only the seeds are persisted; the key material is re-expanded on load.

use dices_crypto::{KeyId, PreKeys, PreKeysPublic};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::storage::{PREKEYS_INDEX, StorageError, indexed_key};

/// A pre-key bundle plus its rotation state.
#[derive(Debug, Clone)]
pub struct PreKeyRecord {
    /// The hybrid keypairs
    pub keys: PreKeys,
    /// Unix milliseconds at which this bundle was superseded, if it was
    pub rotated_at: Option<u64>,
}

/// Wire form of a persisted record: seeds only.
#[derive(Serialize, Deserialize)]
struct StoredPreKeys {
    dh_secret_key: [u8; 32],
    ml_kem_seed: Vec<u8>,
    rotated_at: Option<u64>,
}

impl Drop for StoredPreKeys {
    fn drop(&mut self) {
        self.dh_secret_key.zeroize();
        self.ml_kem_seed.zeroize();
    }
}

impl PreKeyRecord {
    /// Wrap a freshly generated bundle.
    pub fn new(keys: PreKeys) -> Self {
        Self { keys, rotated_at: None }
    }

    /// Whether this bundle has been superseded.
    pub fn is_rotated(&self) -> bool {
        self.rotated_at.is_some()
    }

    /// Storage key for the record with the given bundle id.
    pub fn storage_key(key_id: &KeyId) -> Vec<u8> {
        indexed_key(PREKEYS_INDEX, key_id)
    }

    /// Public projection of the wrapped bundle.
    pub fn public(&self) -> PreKeysPublic {
        self.keys.public()
    }

    /// Serialize for storage.
    ///
    /// # Errors
    ///
    /// - `Serialization` if CBOR encoding fails
    pub fn to_bytes(&self) -> Result<Vec<u8>, StorageError> {
        let stored = StoredPreKeys {
            dh_secret_key: self.keys.dh_secret_bytes(),
            ml_kem_seed: self.keys.ml_kem_seed().to_vec(),
            rotated_at: self.rotated_at,
        };

        let mut buf = Vec::new();
        ciborium::ser::into_writer(&stored, &mut buf)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        Ok(buf)
    }

    /// Rehydrate a record from storage, re-expanding the key material.
    ///
    /// # Errors
    ///
    /// - `Serialization` if CBOR decoding fails or the seed length is wrong
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let stored: StoredPreKeys = ciborium::de::from_reader(bytes)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;

        let ml_kem_seed: [u8; 64] = stored.ml_kem_seed.as_slice().try_into().map_err(|_| {
            StorageError::Serialization(format!(
                "ML-KEM seed has {} bytes, expected 64",
                stored.ml_kem_seed.len()
            ))
        })?;

        Ok(Self {
            keys: PreKeys::from_seeds(stored.dh_secret_key, ml_kem_seed),
            rotated_at: stored.rotated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    #[test]
    fn storage_roundtrip_reproduces_key_material() {
        let mut rng = StdRng::seed_from_u64(1);
        let record = PreKeyRecord::new(PreKeys::generate(&mut rng));

        let restored = PreKeyRecord::from_bytes(&record.to_bytes().unwrap()).unwrap();

        assert_eq!(restored.keys.key_id(), record.keys.key_id());
        assert_eq!(restored.keys.dh_public_key(), record.keys.dh_public_key());
        assert_eq!(restored.keys.encryption_key()[..], record.keys.encryption_key()[..]);
        assert_eq!(restored.rotated_at, None);
    }

    #[test]
    fn rotation_timestamp_survives_roundtrip() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut record = PreKeyRecord::new(PreKeys::generate(&mut rng));
        record.rotated_at = Some(12_345);

        let restored = PreKeyRecord::from_bytes(&record.to_bytes().unwrap()).unwrap();
        assert!(restored.is_rotated());
        assert_eq!(restored.rotated_at, Some(12_345));
    }

    #[test]
    fn storage_key_uses_prekeys_prefix() {
        let key_id: KeyId = [7u8; 8];
        let key = PreKeyRecord::storage_key(&key_id);
        assert_eq!(key[0], PREKEYS_INDEX);
        assert_eq!(&key[1..], key_id);
    }

    #[test]
    fn garbage_bytes_are_rejected() {
        assert!(matches!(
            PreKeyRecord::from_bytes(&[0xFF, 0x00, 0x13]),
            Err(StorageError::Serialization(_))
        ));
    }
}
