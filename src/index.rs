//! In-memory index of stored records, grouped by user.
//!
//! The index is a projection of the snapshot store and never the system of
//! record: it is rebuilt from the store on startup.

use crate::error::{DedupError, Result};
use crate::fingerprint::build_fingerprint;
use crate::storage::SnapshotStore;
use crate::types::{parse_timestamp, SessionRecord, SessionSnapshot};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Totals over every indexed record.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IndexTotals {
    pub users: u64,
    pub sessions: u64,
    pub bytes: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

impl IndexTotals {
    /// Average records per user with records, rounded to one decimal.
    pub fn avg_sessions_per_user(&self) -> f64 {
        if self.users == 0 {
            return 0.0;
        }
        let avg = self.sessions as f64 / self.users as f64;
        (avg * 10.0).round() / 10.0
    }
}

/// Outcome of rebuilding the index from the store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RebuildSummary {
    pub indexed: usize,
    pub skipped: usize,
}

/// User id -> records, newest first.
#[derive(Default)]
pub struct SessionIndex {
    users: RwLock<HashMap<String, Vec<SessionRecord>>>,
}

impl SessionIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from every record in `store`.
    ///
    /// Records that cannot be read or parsed are skipped with a warning.
    /// `is_excluded` filters out reserved keys.
    pub fn rebuild(
        store: &dyn SnapshotStore,
        is_excluded: impl Fn(&str) -> bool,
    ) -> Result<(Self, RebuildSummary)> {
        let index = Self::new();
        let mut summary = RebuildSummary::default();

        for key in store.list()? {
            if is_excluded(&key) {
                continue;
            }
            match Self::load_record(store, &key) {
                Ok(Some(record)) => {
                    index.insert(record);
                    summary.indexed += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "skipping unreadable session record");
                    summary.skipped += 1;
                }
            }
        }

        Ok((index, summary))
    }

    fn load_record(store: &dyn SnapshotStore, key: &str) -> Result<Option<SessionRecord>> {
        let Some(payload) = store.get(key)? else {
            return Ok(None);
        };

        let snapshot: SessionSnapshot = serde_json::from_slice(&payload)
            .map_err(|e| DedupError::Deserialization(e.to_string()))?;
        if snapshot.user_id.trim().is_empty() {
            return Err(DedupError::Corruption("record has no userId".into()));
        }
        let raw_timestamp = snapshot
            .timestamp
            .as_deref()
            .ok_or_else(|| DedupError::Corruption("record has no timestamp".into()))?;
        let timestamp = parse_timestamp(raw_timestamp)?;

        Ok(Some(SessionRecord {
            key: key.to_string(),
            timestamp,
            fingerprint: build_fingerprint(&snapshot),
            size_bytes: payload.len() as u64,
        }))
    }

    /// Insert a record, keeping the user's list newest first.
    pub fn insert(&self, record: SessionRecord) {
        let mut users = self.users.write();
        let records = users.entry(record.user_id().to_string()).or_default();
        let position = records.partition_point(|r| r.timestamp > record.timestamp);
        records.insert(position, record);
    }

    /// Number of a user's records strictly newer than `timestamp`, i.e. the
    /// position a record captured at `timestamp` would take.
    pub fn newer_than(&self, user_id: &str, timestamp: DateTime<Utc>) -> usize {
        self.users
            .read()
            .get(user_id)
            .map(|records| records.partition_point(|r| r.timestamp > timestamp))
            .unwrap_or(0)
    }

    /// Swap in the contents of another index.
    pub fn replace_all(&self, other: SessionIndex) {
        *self.users.write() = other.users.into_inner();
    }

    /// Replace the record stored under `record.key`, re-sorting the list.
    ///
    /// Returns false if the key is not indexed for that user.
    pub fn replace(&self, record: SessionRecord) -> bool {
        let mut users = self.users.write();
        let Some(records) = users.get_mut(record.user_id()) else {
            return false;
        };
        let Some(slot) = records.iter_mut().find(|r| r.key == record.key) else {
            return false;
        };
        *slot = record;
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        true
    }

    /// Remove the given keys from a user's list. Returns the removed records.
    pub fn remove_keys(&self, user_id: &str, keys: &[String]) -> Vec<SessionRecord> {
        let mut users = self.users.write();
        let Some(records) = users.get_mut(user_id) else {
            return Vec::new();
        };
        let (removed, kept): (Vec<_>, Vec<_>) = records
            .drain(..)
            .partition(|r| keys.iter().any(|k| k == &r.key));
        *records = kept;
        removed
    }

    /// Newest record for a user.
    pub fn latest(&self, user_id: &str) -> Option<SessionRecord> {
        self.users
            .read()
            .get(user_id)
            .and_then(|records| records.first().cloned())
    }

    /// All records of a user, newest first.
    pub fn records(&self, user_id: &str) -> Vec<SessionRecord> {
        self.users.read().get(user_id).cloned().unwrap_or_default()
    }

    /// Records of a user beyond the newest `cap`, oldest last.
    pub fn excess(&self, user_id: &str, cap: usize) -> Vec<SessionRecord> {
        self.users
            .read()
            .get(user_id)
            .map(|records| records.iter().skip(cap).cloned().collect())
            .unwrap_or_default()
    }

    /// Copy of the whole index.
    pub fn snapshot(&self) -> HashMap<String, Vec<SessionRecord>> {
        self.users.read().clone()
    }

    /// Ids of every user ever indexed.
    pub fn user_ids(&self) -> Vec<String> {
        self.users.read().keys().cloned().collect()
    }

    /// Whether a user has at least one indexed record.
    pub fn has_records(&self, user_id: &str) -> bool {
        self.users
            .read()
            .get(user_id)
            .map_or(false, |records| !records.is_empty())
    }

    /// Total number of records.
    pub fn count(&self) -> usize {
        self.users.read().values().map(Vec::len).sum()
    }

    /// Aggregate totals.
    pub fn totals(&self) -> IndexTotals {
        let users = self.users.read();
        let mut totals = IndexTotals::default();

        for records in users.values().filter(|r| !r.is_empty()) {
            totals.users += 1;
            for record in records {
                totals.sessions += 1;
                totals.bytes += record.size_bytes;
                totals.oldest = Some(match totals.oldest {
                    Some(t) => t.min(record.timestamp),
                    None => record.timestamp,
                });
                totals.newest = Some(match totals.newest {
                    Some(t) => t.max(record.timestamp),
                    None => record.timestamp,
                });
            }
        }

        totals
    }
}
