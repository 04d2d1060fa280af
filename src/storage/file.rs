//! Directory-backed snapshot store.
//!
//! Each record lives in `<key>.snap`, framed with a magic header, a
//! version byte, the payload length and a CRC32 of the payload. Writes go
//! through a temp file and a rename, so a record is either fully present
//! or absent.

use super::SnapshotStore;
use crate::error::{DedupError, Result};
use fs2::FileExt;
use lru::LruCache;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

/// Magic bytes for record files.
const RECORD_MAGIC: &[u8; 4] = b"SNP\0";

/// Current record format version.
const RECORD_VERSION: u8 = 1;

/// Magic bytes for the store manifest.
const STORE_MAGIC: &[u8; 4] = b"SDS\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

const RECORD_EXTENSION: &str = "snap";

/// magic + version + payload length
const HEADER_SIZE: usize = 4 + 1 + 8;

/// CRC32 trailer.
const TRAILER_SIZE: usize = 4;

/// Snapshot store backed by one file per key.
pub struct FileSnapshotStore {
    /// Base directory.
    path: PathBuf,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// Recently read payloads.
    cache: Mutex<LruCache<String, Vec<u8>>>,
}

impl FileSnapshotStore {
    /// Open an existing store or initialize a new one.
    pub fn open_or_create(
        path: impl AsRef<Path>,
        cache_size: usize,
        create_if_missing: bool,
    ) -> Result<Self> {
        let path = path.as_ref();
        if path.join("MANIFEST").exists() {
            Self::open(path, cache_size)
        } else if create_if_missing {
            Self::create(path, cache_size)
        } else {
            Err(DedupError::NotInitialized)
        }
    }

    /// Initialize a store in `path`, creating the directory if needed.
    pub fn create(path: impl AsRef<Path>, cache_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;
        Self::write_manifest(&path)?;
        let lock_file = Self::acquire_lock(&path)?;
        Ok(Self::assemble(path, lock_file, cache_size))
    }

    /// Open an initialized store.
    pub fn open(path: impl AsRef<Path>, cache_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        Self::verify_manifest(&path)?;
        let lock_file = Self::acquire_lock(&path)?;
        Ok(Self::assemble(path, lock_file, cache_size))
    }

    fn assemble(path: PathBuf, lock_file: File, cache_size: usize) -> Self {
        let cache_size = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            path,
            _lock_file: lock_file,
            cache: Mutex::new(LruCache::new(cache_size)),
        }
    }

    /// Get the store path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the file path for a key.
    fn record_path(&self, key: &str) -> PathBuf {
        self.path.join(format!("{key}.{RECORD_EXTENSION}"))
    }

    fn encode(payload: &[u8]) -> Vec<u8> {
        let mut framed = Vec::with_capacity(HEADER_SIZE + payload.len() + TRAILER_SIZE);
        framed.extend_from_slice(RECORD_MAGIC);
        framed.push(RECORD_VERSION);
        framed.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        framed.extend_from_slice(payload);
        framed.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
        framed
    }

    fn decode(key: &str, framed: &[u8]) -> Result<Vec<u8>> {
        if framed.len() < HEADER_SIZE + TRAILER_SIZE {
            return Err(DedupError::Corruption(format!("{key}: truncated record")));
        }
        if &framed[0..4] != RECORD_MAGIC {
            return Err(DedupError::InvalidFormat(format!("{key}: invalid record magic")));
        }
        if framed[4] != RECORD_VERSION {
            return Err(DedupError::InvalidFormat(format!(
                "{key}: unsupported record version: {}",
                framed[4]
            )));
        }

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&framed[5..HEADER_SIZE]);
        let payload_len = u64::from_le_bytes(len_bytes);
        let available = framed.len() - HEADER_SIZE - TRAILER_SIZE;
        if payload_len != available as u64 {
            return Err(DedupError::Corruption(format!(
                "{key}: payload length {payload_len} does not match file size {}",
                framed.len()
            )));
        }
        let payload_len = available;

        let payload = &framed[HEADER_SIZE..HEADER_SIZE + payload_len];
        let mut checksum_bytes = [0u8; 4];
        checksum_bytes.copy_from_slice(&framed[HEADER_SIZE + payload_len..]);
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(payload);
        if stored_checksum != computed_checksum {
            return Err(DedupError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        Ok(payload.to_vec())
    }

    fn write_manifest(path: &Path) -> Result<()> {
        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        let manifest_path = path.join("MANIFEST");
        if !manifest_path.exists() {
            return Err(DedupError::NotInitialized);
        }
        let mut file = File::open(manifest_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(DedupError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(DedupError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| DedupError::Locked)?;
        Ok(lock_file)
    }
}

/// Keys become file names, so only a conservative character set is allowed.
fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key.len() <= 200
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(DedupError::InvalidKey(key.to_string()))
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn put(&self, key: &str, payload: &[u8]) -> Result<()> {
        validate_key(key)?;

        let final_path = self.record_path(key);
        let tmp_path = self.path.join(format!("{key}.{RECORD_EXTENSION}.tmp"));

        let mut file = File::create(&tmp_path)?;
        file.write_all(&Self::encode(payload))?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, &final_path)?;

        self.cache.lock().put(key.to_string(), payload.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;

        if let Some(cached) = self.cache.lock().get(key).cloned() {
            return Ok(Some(cached));
        }

        let record_path = self.record_path(key);
        if !record_path.exists() {
            return Ok(None);
        }

        let framed = fs::read(&record_path)?;
        let payload = Self::decode(key, &framed)?;
        self.cache.lock().put(key.to_string(), payload.clone());
        Ok(Some(payload))
    }

    fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        self.cache.lock().pop(key);

        let record_path = self.record_path(key);
        if record_path.exists() {
            fs::remove_file(&record_path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn exists(&self, key: &str) -> bool {
        if self.cache.lock().contains(key) {
            return true;
        }
        validate_key(key).is_ok() && self.record_path(key).exists()
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();

        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if validate_key(stem).is_ok() {
                    keys.push(stem.to_string());
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}
