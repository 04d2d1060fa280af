//! Removal of volatile keys before hashing.

use serde_json::{Map, Value};

/// Substrings marking a storage key as volatile. Matching is case-sensitive.
const VOLATILE_STORAGE_MARKERS: [&str; 3] = ["timestamp", "_ts", "expir"];

/// Metadata keys dropped before hashing.
///
/// `lastMerged` and `mergeCount` are written by the merge step itself and
/// must not make a merged record look different from the capture it absorbed.
const VOLATILE_METADATA_KEYS: [&str; 5] = [
    "timestamp",
    "extractionTimestamp",
    "sessionId",
    "lastMerged",
    "mergeCount",
];

/// Copy of a local/session storage map without volatile keys.
pub fn normalize_storage(storage: &Map<String, Value>) -> Map<String, Value> {
    storage
        .iter()
        .filter(|(key, _)| {
            !VOLATILE_STORAGE_MARKERS
                .iter()
                .any(|marker| key.contains(marker))
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Shallow copy of a metadata map without volatile keys.
pub fn normalize_metadata(metadata: &Map<String, Value>) -> Map<String, Value> {
    let mut normalized = metadata.clone();
    for key in VOLATILE_METADATA_KEYS {
        normalized.remove(key);
    }
    normalized
}
