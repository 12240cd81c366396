//! Storage abstraction for overlay records
//!
//! Trait-based key-value persistence injected into the overlay. Records are
//! keyed by a one-byte type prefix followed by an identifier (`0x00 ‖ keyId`
//! for pre-key bundles, `0x01 ‖ ratchetId` for session state), so ordered
//! prefix scans enumerate one record type at a time.

mod error;
mod memory;

use async_trait::async_trait;
pub use error::StorageError;
pub use memory::MemoryStorage;

/// Index prefix for pre-key bundle records
pub const PREKEYS_INDEX: u8 = 0x00;

/// Index prefix for session state records
pub const SESSION_INDEX: u8 = 0x01;

/// Build a storage key from a type prefix and identifier.
pub fn indexed_key(index: u8, id: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + id.len());
    key.push(index);
    key.extend_from_slice(id);
    key
}

/// Key-value persistence for overlay records
///
/// This trait must be:
/// - Clone: shared between the overlay and background pruning
/// - Send + Sync: safe under the per-session lock map
///
/// The overlay treats a successful `put` as the commit point for ratchet
/// state; implementations must not report success before the record is
/// durable to whatever degree the deployment requires.
#[async_trait]
pub trait Storage: Clone + Send + Sync + 'static {
    /// Fetch the record stored under `key`, if any.
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store `value` under `key`, replacing any existing record.
    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), StorageError>;

    /// Delete the record under `key`. Deleting a missing key is not an
    /// error.
    async fn del(&self, key: &[u8]) -> Result<(), StorageError>;

    /// All records whose key starts with `prefix`, ordered by raw byte
    /// order of the full key.
    async fn iterate(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexed_key_prepends_prefix() {
        assert_eq!(indexed_key(PREKEYS_INDEX, &[0xAA, 0xBB]), vec![0x00, 0xAA, 0xBB]);
        assert_eq!(indexed_key(SESSION_INDEX, &[]), vec![0x01]);
    }
}
