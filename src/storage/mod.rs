//! Persistence boundary for snapshot payloads.
//!
//! The engine only needs a key-value store of opaque byte payloads that can
//! enumerate its keys, which is enough to rebuild the index at startup.

mod file;
mod memory;

pub use file::FileSnapshotStore;
pub use memory::MemorySnapshotStore;

use crate::error::Result;

/// Key-value store holding serialized snapshots.
pub trait SnapshotStore: Send + Sync {
    /// Write `payload` under `key`, replacing any previous value.
    ///
    /// When this returns `Ok` the payload is durable.
    fn put(&self, key: &str, payload: &[u8]) -> Result<()>;

    /// Read the payload stored under `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Remove `key`. Returns whether it existed.
    fn delete(&self, key: &str) -> Result<bool>;

    /// Check if a key exists.
    fn exists(&self, key: &str) -> bool;

    /// List all stored keys.
    fn list(&self) -> Result<Vec<String>>;
}
