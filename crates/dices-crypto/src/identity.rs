//! Node identity: secp256k1 keys and recoverable signatures
//!
//! A node is identified by the hash of its secp256k1 public key. Envelopes
//! and published pre-key values carry a *recoverable* signature instead of
//! a signer field: verifiers recover the public key from the signature over
//! the content hash and derive the sender's node id from it, so identity
//! and authentication cannot diverge.

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CryptoError;

/// Node identifier size in bytes
pub const NODE_ID_SIZE: usize = 20;

/// Compressed secp256k1 public key size in bytes
pub const PUBLIC_KEY_SIZE: usize = 33;

/// Session identifier size in bytes
pub const RATCHET_ID_SIZE: usize = 32;

/// A public-key-derived node identifier (20 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; NODE_ID_SIZE]);

impl NodeId {
    /// Derive a node id from a compressed secp256k1 public key.
    pub fn from_public_key(public_key: &[u8; PUBLIC_KEY_SIZE]) -> Self {
        let digest = Sha256::digest(public_key);
        let mut id = [0u8; NODE_ID_SIZE];
        id.copy_from_slice(&digest[..NODE_ID_SIZE]);
        Self(id)
    }

    /// Wrap raw node id bytes.
    pub fn from_bytes(bytes: [u8; NODE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw node id bytes.
    pub fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({self})")
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Order-independent session identifier for an unordered peer pair.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RatchetId([u8; RATCHET_ID_SIZE]);

impl RatchetId {
    /// Wrap raw ratchet id bytes.
    pub fn from_bytes(bytes: [u8; RATCHET_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw ratchet id bytes.
    pub fn as_bytes(&self) -> &[u8; RATCHET_ID_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for RatchetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // First 8 bytes are plenty for log correlation
        write!(f, "RatchetId(")?;
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

/// Compute the session identifier for a peer pair.
///
/// Hashes the two node ids in lexicographic order, so both peers compute
/// the same value regardless of who initiates.
pub fn ratchet_id(a: &NodeId, b: &NodeId) -> RatchetId {
    let (lo, hi) = if a.as_bytes() <= b.as_bytes() { (a, b) } else { (b, a) };

    let mut hasher = Sha256::new();
    hasher.update(lo.as_bytes());
    hasher.update(hi.as_bytes());

    let mut id = [0u8; RATCHET_ID_SIZE];
    id.copy_from_slice(&hasher.finalize());
    RatchetId(id)
}

/// A recoverable secp256k1 signature: 64-byte compact signature plus the
/// recovery selector.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RSignature {
    /// Compact ECDSA signature (r ‖ s)
    pub signature: [u8; 64],
    /// Recovery selector (0-3)
    pub recovery_id: u8,
}

impl std::fmt::Debug for RSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RSignature").field("recovery_id", &self.recovery_id).finish_non_exhaustive()
    }
}

impl RSignature {
    /// Recover the compressed public key that produced this signature over
    /// `digest`.
    ///
    /// # Errors
    ///
    /// - `Signature` if the signature bytes or recovery selector are
    ///   malformed, or no public key can be recovered
    pub fn recover(&self, digest: &[u8; 32]) -> Result<[u8; PUBLIC_KEY_SIZE], CryptoError> {
        let signature = Signature::from_slice(&self.signature)
            .map_err(|err| CryptoError::Signature { reason: err.to_string() })?;
        let recovery_id = RecoveryId::from_byte(self.recovery_id).ok_or_else(|| {
            CryptoError::Signature { reason: "invalid recovery selector".to_string() }
        })?;

        let verifying_key = VerifyingKey::recover_from_prehash(digest, &signature, recovery_id)
            .map_err(|err| CryptoError::Signature { reason: err.to_string() })?;

        let point = verifying_key.to_encoded_point(true);
        let mut public_key = [0u8; PUBLIC_KEY_SIZE];
        public_key.copy_from_slice(point.as_bytes());
        Ok(public_key)
    }

    /// Recover the signer's node id from this signature over `digest`.
    ///
    /// # Errors
    ///
    /// - `Signature` as for [`recover`](Self::recover)
    pub fn recover_node_id(&self, digest: &[u8; 32]) -> Result<NodeId, CryptoError> {
        Ok(NodeId::from_public_key(&self.recover(digest)?))
    }
}

/// Local signing identity.
///
/// Wraps a secp256k1 signing key. The corresponding node id is the
/// truncated hash of the compressed public key.
#[derive(Clone)]
pub struct Keys {
    signing_key: SigningKey,
}

impl Keys {
    /// Generate a fresh identity.
    pub fn generate(rng: &mut impl CryptoRngCore) -> Self {
        Self { signing_key: SigningKey::random(rng) }
    }

    /// Restore an identity from a 32-byte secret scalar.
    ///
    /// # Errors
    ///
    /// - `InvalidSecretKey` if the scalar is zero or out of range
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Result<Self, CryptoError> {
        let signing_key = SigningKey::from_bytes(secret.into())
            .map_err(|_| CryptoError::InvalidSecretKey)?;
        Ok(Self { signing_key })
    }

    /// Raw secret scalar (for persistence by the caller).
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes().into()
    }

    /// Compressed secp256k1 public key.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        let point = self.signing_key.verifying_key().to_encoded_point(true);
        let mut public_key = [0u8; PUBLIC_KEY_SIZE];
        public_key.copy_from_slice(point.as_bytes());
        public_key
    }

    /// This identity's node id.
    pub fn node_id(&self) -> NodeId {
        NodeId::from_public_key(&self.public_key())
    }

    /// Produce a recoverable signature over a 32-byte digest.
    ///
    /// # Errors
    ///
    /// - `Signature` if signing fails (effectively never for a valid key)
    pub fn sign_recoverable(&self, digest: &[u8; 32]) -> Result<RSignature, CryptoError> {
        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(digest)
            .map_err(|err| CryptoError::Signature { reason: err.to_string() })?;

        let mut compact = [0u8; 64];
        compact.copy_from_slice(&signature.to_bytes());

        Ok(RSignature { signature: compact, recovery_id: recovery_id.to_byte() })
    }
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys").field("node_id", &self.node_id()).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    #[test]
    fn sign_and_recover_roundtrip() {
        let mut rng = StdRng::seed_from_u64(1);
        let keys = Keys::generate(&mut rng);
        let digest = Sha256::digest(b"payload").into();

        let signature = keys.sign_recoverable(&digest).unwrap();

        assert_eq!(signature.recover(&digest).unwrap(), keys.public_key());
        assert_eq!(signature.recover_node_id(&digest).unwrap(), keys.node_id());
    }

    #[test]
    fn recovery_over_wrong_digest_yields_different_key() {
        let mut rng = StdRng::seed_from_u64(2);
        let keys = Keys::generate(&mut rng);
        let digest = Sha256::digest(b"payload").into();
        let other: [u8; 32] = Sha256::digest(b"tampered").into();

        let signature = keys.sign_recoverable(&digest).unwrap();
        let recovered = signature.recover(&other);

        // Either recovery fails outright or recovers an unrelated key.
        if let Ok(public_key) = recovered {
            assert_ne!(public_key, keys.public_key());
        }
    }

    #[test]
    fn secret_bytes_roundtrip() {
        let mut rng = StdRng::seed_from_u64(3);
        let keys = Keys::generate(&mut rng);

        let restored = Keys::from_secret_bytes(&keys.secret_bytes()).unwrap();
        assert_eq!(restored.node_id(), keys.node_id());
        assert_eq!(restored.public_key(), keys.public_key());
    }

    #[test]
    fn zero_secret_is_rejected() {
        assert_eq!(Keys::from_secret_bytes(&[0u8; 32]).map(|_| ()), Err(CryptoError::InvalidSecretKey));
    }

    #[test]
    fn ratchet_id_is_order_independent() {
        let a = NodeId::from_bytes([1u8; NODE_ID_SIZE]);
        let b = NodeId::from_bytes([2u8; NODE_ID_SIZE]);

        assert_eq!(ratchet_id(&a, &b), ratchet_id(&b, &a));
    }

    #[test]
    fn ratchet_id_distinguishes_pairs() {
        let a = NodeId::from_bytes([1u8; NODE_ID_SIZE]);
        let b = NodeId::from_bytes([2u8; NODE_ID_SIZE]);
        let c = NodeId::from_bytes([3u8; NODE_ID_SIZE]);

        assert_ne!(ratchet_id(&a, &b), ratchet_id(&a, &c));
    }

    #[test]
    fn node_ids_differ_between_identities() {
        let mut rng = StdRng::seed_from_u64(4);
        let a = Keys::generate(&mut rng);
        let b = Keys::generate(&mut rng);
        assert_ne!(a.node_id(), b.node_id());
    }
}
