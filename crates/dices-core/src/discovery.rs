//! DHT discovery boundary: signed pre-key lookup
//!
//! The overlay consumes an external DHT through this trait. The only
//! operation it needs is `find_value`: fetching the signed pre-key bundle
//! a peer has published under its node id. The DHT's routing table,
//! iterative lookup, and transport live entirely behind the trait.

use async_trait::async_trait;
use dices_crypto::{CryptoError, Keys, NodeId, PreKeysPublic, RSignature};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors from DHT lookups
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// Lookup did not complete within the configured timeout
    #[error("lookup timed out after {elapsed_ms} ms")]
    Timeout {
        /// How long we waited
        elapsed_ms: u64,
    },

    /// Lookup failed in the underlying overlay
    #[error("lookup failed: {0}")]
    Lookup(String),
}

/// A peer's published pre-key value, signed by its identity key.
///
/// Stored in the DHT under the publisher's node id. Like envelopes, the
/// value carries no signer field: the publisher's identity is recovered
/// from `r_signature` over the value hash and must match the node id the
/// value was fetched under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPreKeys {
    /// Public pre-key bundle for session initiation
    pub initiation_keys: PreKeysPublic,
    /// Unix milliseconds at signing time
    pub signed_at: u64,
    /// Recoverable signature over the value hash
    pub r_signature: RSignature,
}

impl SignedPreKeys {
    /// Sign a pre-key bundle for publication.
    ///
    /// # Errors
    ///
    /// - `Signature` if signing fails (effectively never for a valid key)
    pub fn create(
        initiation_keys: PreKeysPublic,
        signed_at: u64,
        keys: &Keys,
    ) -> Result<Self, CryptoError> {
        let hash = Self::hash_parts(&initiation_keys, signed_at);
        let r_signature = keys.sign_recoverable(&hash)?;
        Ok(Self { initiation_keys, signed_at, r_signature })
    }

    /// Hash of the signed content.
    pub fn hash(&self) -> [u8; 32] {
        Self::hash_parts(&self.initiation_keys, self.signed_at)
    }

    /// Recover the publisher's node id from the signature.
    ///
    /// # Errors
    ///
    /// - `Signature` if the signature is malformed or recovery fails
    pub fn recover_node_id(&self) -> Result<NodeId, CryptoError> {
        self.r_signature.recover_node_id(&self.hash())
    }

    fn hash_parts(initiation_keys: &PreKeysPublic, signed_at: u64) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(initiation_keys.key_id);
        hasher.update(&initiation_keys.encryption_key);
        hasher.update(&initiation_keys.dh_public_key);
        hasher.update(signed_at.to_be_bytes());
        hasher.finalize().into()
    }
}

/// DHT value lookup consumed by the overlay
///
/// Invoked once per peer on first-ever send, on a responder's first reply,
/// and whenever a rekey is scheduled.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Fetch the signed pre-key value published under `node_id`.
    ///
    /// Returns `None` when the DHT holds no value for this node.
    async fn find_value(&self, node_id: &NodeId) -> Result<Option<SignedPreKeys>, DiscoveryError>;
}

#[cfg(test)]
mod tests {
    use dices_crypto::PreKeys;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    #[test]
    fn signed_value_recovers_publisher() {
        let mut rng = StdRng::seed_from_u64(1);
        let keys = Keys::generate(&mut rng);
        let bundle = PreKeys::generate(&mut rng);

        let value = SignedPreKeys::create(bundle.public(), 1_000, &keys).unwrap();
        assert_eq!(value.recover_node_id().unwrap(), keys.node_id());
    }

    #[test]
    fn tampered_value_recovers_different_identity() {
        let mut rng = StdRng::seed_from_u64(2);
        let keys = Keys::generate(&mut rng);
        let bundle = PreKeys::generate(&mut rng);

        let mut value = SignedPreKeys::create(bundle.public(), 1_000, &keys).unwrap();
        value.signed_at += 1;

        match value.recover_node_id() {
            Ok(recovered) => assert_ne!(recovered, keys.node_id()),
            Err(_) => {}, // recovery failure also counts as rejection
        }
    }
}
