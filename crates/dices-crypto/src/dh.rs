//! X25519 helpers over raw 32-byte buffers
//!
//! The session layer stores DH keys as plain byte arrays (they are
//! persisted inside ratchet state); these helpers keep the dalek types
//! contained to this crate.

use rand_core::CryptoRngCore;
use x25519_dalek::{PublicKey, StaticSecret};

/// Generate a fresh X25519 keypair, returned as raw (secret, public) bytes.
pub fn generate_keypair(rng: &mut impl CryptoRngCore) -> ([u8; 32], [u8; 32]) {
    let secret = StaticSecret::random_from_rng(&mut *rng);
    let public = PublicKey::from(&secret);
    (secret.to_bytes(), public.to_bytes())
}

/// X25519 shared secret between a local secret key and a remote public key.
pub fn shared_secret(secret_key: &[u8; 32], remote_public_key: &[u8; 32]) -> [u8; 32] {
    let shared = StaticSecret::from(*secret_key)
        .diffie_hellman(&PublicKey::from(*remote_public_key));
    *shared.as_bytes()
}
