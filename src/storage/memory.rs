//! In-memory snapshot store.

use super::SnapshotStore;
use crate::error::Result;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Snapshot store kept entirely in memory.
#[derive(Default)]
pub struct MemorySnapshotStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn put(&self, key: &str, payload: &[u8]) -> Result<()> {
        self.entries.write().insert(key.to_string(), payload.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }

    fn exists(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}
