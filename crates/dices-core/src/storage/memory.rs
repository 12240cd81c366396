//! In-memory storage implementation for testing and simulation

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;

use super::{Storage, StorageError};

/// In-memory storage backed by a `BTreeMap`.
///
/// The ordered map gives prefix iteration in raw byte order for free. All
/// state sits behind `Arc<Mutex<_>>` so clones share one store, matching
/// the semantics of a real database handle. Uses `lock().expect()`, which
/// panics if the mutex is poisoned - acceptable for test code.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned (a thread panicked while
    /// holding the lock). This is acceptable for test/simulation code.
    #[allow(clippy::expect_used)]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").len()
    }

    /// Whether the store is empty.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for
    /// test/simulation code.
    #[allow(clippy::expect_used)]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("Mutex poisoned").is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for
    /// test code.
    #[allow(clippy::expect_used)]
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.inner.lock().expect("Mutex poisoned").get(key).cloned())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for
    /// test code.
    #[allow(clippy::expect_used)]
    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), StorageError> {
        self.inner.lock().expect("Mutex poisoned").insert(key.to_vec(), value);
        Ok(())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for
    /// test code.
    #[allow(clippy::expect_used)]
    async fn del(&self, key: &[u8]) -> Result<(), StorageError> {
        self.inner.lock().expect("Mutex poisoned").remove(key);
        Ok(())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for
    /// test code.
    #[allow(clippy::expect_used)]
    async fn iterate(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}
