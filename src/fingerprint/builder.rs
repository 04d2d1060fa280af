//! Fingerprint construction.

use super::normalize::{normalize_metadata, normalize_storage};
use crate::types::{ContentHash, SessionSnapshot};
use serde::Serialize;
use serde_json::{Map, Value};

/// Content digests summarizing a normalized snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    pub user_id: String,
    pub user_info_hash: ContentHash,
    pub local_storage_hash: ContentHash,
    pub session_storage_hash: ContentHash,
    pub metadata_hash: ContentHash,
    /// Digest over user id, user info and the normalized storage and
    /// metadata together. Used only for the exact-equality check.
    pub core_data_hash: ContentHash,
}

/// Build the fingerprint of a snapshot.
pub fn build_fingerprint(snapshot: &SessionSnapshot) -> Fingerprint {
    let local_storage = normalize_storage(&snapshot.local_storage);
    let session_storage = normalize_storage(&snapshot.session_storage);
    let metadata = normalize_metadata(&snapshot.metadata);

    let mut core = Map::new();
    core.insert("userId".into(), Value::from(snapshot.user_id.as_str()));
    core.insert("userInfo".into(), Value::Object(snapshot.user_info.clone()));
    core.insert("localStorage".into(), Value::Object(local_storage.clone()));
    core.insert("sessionStorage".into(), Value::Object(session_storage.clone()));
    core.insert("metadata".into(), Value::Object(metadata.clone()));

    Fingerprint {
        user_id: snapshot.user_id.clone(),
        user_info_hash: digest_map(&snapshot.user_info),
        local_storage_hash: digest_map(&local_storage),
        session_storage_hash: digest_map(&session_storage),
        metadata_hash: digest_map(&metadata),
        core_data_hash: digest_map(&core),
    }
}

/// Rebuild a JSON value with object keys sorted at every nesting level.
///
/// Array order is significant and left alone.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(canonical_map(map)),
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn canonical_map(map: &Map<String, Value>) -> Map<String, Value> {
    let mut entries: Vec<(&String, &Value)> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
        .into_iter()
        .map(|(key, value)| (key.clone(), canonicalize(value)))
        .collect()
}

fn digest_map(map: &Map<String, Value>) -> ContentHash {
    let canonical = Value::Object(canonical_map(map));
    ContentHash::from_bytes(canonical.to_string().as_bytes())
}
