//! Root-key derivation using HKDF

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

/// Domain-separation label for root-key derivation
const ROOT_KEY_INFO: &[u8] = b"DICES-v1-root";

/// Derive a new root key and chain key from a ratchet event.
///
/// HKDF-SHA256 with the current root key as salt and the DH shared secret
/// (concatenated with the ML-KEM shared secret on hybrid rekeys) as input
/// key material. Produces 64 bytes split into a 32-byte root key and a
/// 32-byte chain key.
///
/// # Security
///
/// - The previous root key only enters as salt, so compromise of the new
///   root key does not reveal it
/// - Hybrid rekeys mix the post-quantum secret into the same derivation,
///   keeping the result secure if either input secret holds
/// - Deterministic: both peers derive identical keys from identical inputs
pub fn derive_root_key(
    root_key: &[u8; 32],
    dh_shared_secret: &[u8; 32],
    kem_shared_secret: Option<&[u8; 32]>,
) -> ([u8; 32], [u8; 32]) {
    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(dh_shared_secret);
    let ikm_len = match kem_shared_secret {
        Some(kem) => {
            ikm[32..].copy_from_slice(kem);
            64
        },
        None => 32,
    };

    let hkdf = Hkdf::<Sha256>::new(Some(root_key), &ikm[..ikm_len]);

    let mut okm = [0u8; 64];
    let Ok(()) = hkdf.expand(ROOT_KEY_INFO, &mut okm) else {
        unreachable!("64 bytes is a valid HKDF-SHA256 output length");
    };

    let mut new_root_key = [0u8; 32];
    let mut new_chain_key = [0u8; 32];
    new_root_key.copy_from_slice(&okm[..32]);
    new_chain_key.copy_from_slice(&okm[32..]);

    ikm.zeroize();
    okm.zeroize();

    (new_root_key, new_chain_key)
}
