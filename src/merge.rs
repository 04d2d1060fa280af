//! Folding a new snapshot into a persisted record.

use crate::types::{format_timestamp, SessionSnapshot};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Overlay `incoming` onto the persisted record `existing`.
///
/// The timestamp always advances to the incoming one, cookies are replaced
/// when the incoming snapshot carries any, storage and metadata become a
/// key union where incoming values win, and metadata gains `lastMerged` and
/// an incremented `mergeCount`. Every other field of `existing` is kept.
pub fn merge_snapshots(
    existing: &SessionSnapshot,
    incoming: &SessionSnapshot,
    merged_at: DateTime<Utc>,
) -> SessionSnapshot {
    let mut merged = existing.clone();

    merged.timestamp = incoming.timestamp.clone().or_else(|| existing.timestamp.clone());
    if incoming.cookies.is_some() {
        merged.cookies = incoming.cookies.clone();
    }

    overlay(&mut merged.local_storage, &incoming.local_storage);
    overlay(&mut merged.session_storage, &incoming.session_storage);
    overlay(&mut merged.metadata, &incoming.metadata);

    let merge_count = existing
        .metadata
        .get("mergeCount")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    merged
        .metadata
        .insert("lastMerged".into(), Value::from(format_timestamp(merged_at)));
    merged
        .metadata
        .insert("mergeCount".into(), Value::from(merge_count + 1));

    merged
}

fn overlay(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    for (key, value) in source {
        target.insert(key.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(value: Value) -> SessionSnapshot {
        serde_json::from_value(value).unwrap()
    }

    fn existing() -> SessionSnapshot {
        snapshot(json!({
            "userId": "100",
            "timestamp": "2024-05-01T10:00:00Z",
            "userInfo": {"name": "Ana"},
            "localStorage": {"theme": "dark", "old": "1"},
            "sessionStorage": {"step": "1"},
            "metadata": {"source": "extension"},
            "cookies": [{"name": "sid", "value": "a"}],
            "url": "https://example.test/account"
        }))
    }

    #[test]
    fn test_overlay_rules() {
        let incoming = snapshot(json!({
            "userId": "100",
            "timestamp": "2024-05-01T11:00:00Z",
            "userInfo": {"name": "Other"},
            "localStorage": {"theme": "light", "new": "2"},
            "sessionStorage": {},
            "metadata": {"tab": 3},
            "cookies": [{"name": "sid", "value": "b"}],
            "url": "https://example.test/ignored"
        }));

        let merged = merge_snapshots(&existing(), &incoming, Utc::now());

        assert_eq!(merged.timestamp.as_deref(), Some("2024-05-01T11:00:00Z"));
        assert_eq!(merged.cookies, incoming.cookies);
        assert_eq!(merged.local_storage["theme"], "light");
        assert_eq!(merged.local_storage["old"], "1");
        assert_eq!(merged.local_storage["new"], "2");
        assert_eq!(merged.session_storage["step"], "1");
        assert_eq!(merged.metadata["source"], "extension");
        assert_eq!(merged.metadata["tab"], 3);
        assert_eq!(merged.metadata["mergeCount"], 1);
        assert!(merged.metadata.contains_key("lastMerged"));
        // Fields outside the overlay set come from the persisted record.
        assert_eq!(merged.user_info["name"], "Ana");
        assert_eq!(merged.extra["url"], "https://example.test/account");
    }

    #[test]
    fn test_absent_cookies_keep_existing() {
        let incoming = snapshot(json!({"userId": "100", "timestamp": "2024-05-01T11:00:00Z"}));
        let merged = merge_snapshots(&existing(), &incoming, Utc::now());
        assert_eq!(merged.cookies, existing().cookies);
    }

    #[test]
    fn test_merge_count_accumulates() {
        let incoming = snapshot(json!({"userId": "100", "timestamp": "2024-05-01T11:00:00Z"}));
        let once = merge_snapshots(&existing(), &incoming, Utc::now());
        let twice = merge_snapshots(&once, &incoming, Utc::now());
        assert_eq!(twice.metadata["mergeCount"], 2);
    }
}
