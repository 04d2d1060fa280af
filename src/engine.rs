//! The deduplication engine tying the index, policy, merge and retention
//! together.

use crate::config::EngineConfig;
use crate::error::{DedupError, Result};
use crate::fingerprint::{build_fingerprint, Fingerprint};
use crate::index::{RebuildSummary, SessionIndex};
use crate::merge::merge_snapshots;
use crate::policy::{decide, Decision};
use crate::retention::RetentionManager;
use crate::storage::{FileSnapshotStore, SnapshotStore};
use crate::types::{
    CleanupReport, EngineStats, ProcessAction, ProcessOutcome, SessionRecord, SessionSnapshot,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Longest user id fragment embedded in a storage key.
const MAX_KEY_USER_LEN: usize = 64;

/// Session snapshot deduplication and retention engine.
///
/// The engine is the single owner of its store. Processing is serialized
/// per user, and a cleanup pass excludes all processing while it runs.
pub struct SessionEngine {
    config: EngineConfig,

    store: Arc<dyn SnapshotStore>,

    index: SessionIndex,

    retention: RetentionManager,

    /// One mutex per user id, held across read-decide-write. Entries of
    /// users without records are pruned by cleanup.
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,

    /// Shared by snapshot processing, exclusive for cleanup.
    sweep_gate: RwLock<()>,

    /// Suffix for generated keys.
    key_counter: AtomicU64,
}

impl SessionEngine {
    /// Open the engine over a file store at `config.path`.
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let store = FileSnapshotStore::open_or_create(
            &config.path,
            config.cache_size,
            config.create_if_missing,
        )?;
        Self::with_store(config, Arc::new(store))
    }

    /// Build the engine over any snapshot store, rebuilding the index from it.
    pub fn with_store(config: EngineConfig, store: Arc<dyn SnapshotStore>) -> Result<Self> {
        config.validate()?;

        let (index, summary) = SessionIndex::rebuild(store.as_ref(), |key| config.is_excluded(key))?;
        let retention = RetentionManager::from_config(&config);

        let engine = Self {
            config,
            store,
            index,
            retention,
            user_locks: Mutex::new(HashMap::new()),
            sweep_gate: RwLock::new(()),
            key_counter: AtomicU64::new(0),
        };

        let trimmed = engine.apply_user_caps();
        tracing::info!(
            indexed = summary.indexed,
            skipped = summary.skipped,
            trimmed = trimmed.removed_records,
            users = engine.index.user_ids().len(),
            "session index rebuilt"
        );

        Ok(engine)
    }

    /// Re-apply the per-user cap to every user.
    fn apply_user_caps(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        for user_id in self.index.user_ids() {
            let trimmed = self
                .retention
                .enforce_user_cap(&self.index, self.store.as_ref(), &user_id);
            report.absorb(&trimmed);
        }
        report
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // --- Ingestion ---

    /// Parse raw JSON and process it as a snapshot.
    pub fn process_json(&self, raw: &[u8]) -> Result<ProcessOutcome> {
        self.process_snapshot(SessionSnapshot::from_json(raw)?)
    }

    /// Decide whether to create, merge or skip `snapshot`, and apply it.
    ///
    /// Malformed snapshots are rejected before any state is touched. If the
    /// store write fails the error is returned and the index is unchanged.
    pub fn process_snapshot(&self, mut snapshot: SessionSnapshot) -> Result<ProcessOutcome> {
        let timestamp = snapshot.validate(self.config.default_missing_timestamp, Utc::now())?;

        let _gate = self.sweep_gate.read();
        let user_lock = self.user_lock(&snapshot.user_id);
        let _guard = user_lock.lock();

        let fingerprint = build_fingerprint(&snapshot);
        let latest = self.index.latest(&snapshot.user_id);
        let decision = decide(
            &fingerprint,
            latest.as_ref(),
            self.config.significant_change_threshold,
        );

        tracing::debug!(
            user_id = %snapshot.user_id,
            decision = ?decision,
            "snapshot decision"
        );

        match decision {
            Decision::Create { reason } => self.create_record(snapshot, timestamp, fingerprint, reason),
            Decision::Merge { target_key, reason } => {
                self.merge_record(&target_key, snapshot, timestamp, reason)
            }
            Decision::Skip { reason } => Ok(ProcessOutcome {
                saved: false,
                action: ProcessAction::Skipped,
                key: None,
                reason,
                bytes_saved: Some(snapshot.encoded_len()?),
            }),
        }
    }

    fn create_record(
        &self,
        snapshot: SessionSnapshot,
        timestamp: DateTime<Utc>,
        fingerprint: Fingerprint,
        reason: String,
    ) -> Result<ProcessOutcome> {
        let payload =
            serde_json::to_vec(&snapshot).map_err(|e| DedupError::Serialization(e.to_string()))?;

        // A capture older than a full list would be evicted as soon as it
        // landed.
        let cap = self.config.max_sessions_per_user;
        if self.index.newer_than(&snapshot.user_id, timestamp) >= cap {
            tracing::debug!(
                user_id = %snapshot.user_id,
                cap,
                "capture older than every retained record, not stored"
            );
            return Ok(ProcessOutcome {
                saved: false,
                action: ProcessAction::Skipped,
                key: None,
                reason: format!("{reason}, but older than the {cap} retained records"),
                bytes_saved: Some(payload.len() as u64),
            });
        }

        let key = self.next_key(&snapshot.user_id, timestamp);

        self.store.put(&key, &payload)?;

        self.index.insert(SessionRecord {
            key: key.clone(),
            timestamp,
            fingerprint,
            size_bytes: payload.len() as u64,
        });

        let evicted = self
            .retention
            .enforce_user_cap(&self.index, self.store.as_ref(), &snapshot.user_id);

        tracing::info!(
            user_id = %snapshot.user_id,
            key = %key,
            bytes = payload.len(),
            evicted = evicted.removed_records,
            "session record created"
        );

        Ok(ProcessOutcome {
            saved: true,
            action: ProcessAction::Created,
            key: Some(key),
            reason,
            bytes_saved: None,
        })
    }

    fn merge_record(
        &self,
        key: &str,
        snapshot: SessionSnapshot,
        timestamp: DateTime<Utc>,
        reason: String,
    ) -> Result<ProcessOutcome> {
        let existing = self.load_snapshot(key)?.ok_or_else(|| DedupError::RecordNotFound(key.to_string()))?;

        let merged = merge_snapshots(&existing, &snapshot, Utc::now());
        let payload =
            serde_json::to_vec(&merged).map_err(|e| DedupError::Serialization(e.to_string()))?;

        self.store.put(key, &payload)?;

        self.index.replace(SessionRecord {
            key: key.to_string(),
            timestamp,
            fingerprint: build_fingerprint(&merged),
            size_bytes: payload.len() as u64,
        });

        tracing::debug!(user_id = %snapshot.user_id, key, "session record merged");

        Ok(ProcessOutcome {
            saved: true,
            action: ProcessAction::Merged,
            key: Some(key.to_string()),
            reason,
            bytes_saved: Some(snapshot.encoded_len()?),
        })
    }

    fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock();
        Arc::clone(locks.entry(user_id.to_string()).or_default())
    }

    fn next_key(&self, user_id: &str, timestamp: DateTime<Utc>) -> String {
        let base = format!(
            "session_{}_{}",
            sanitize_key_component(user_id),
            timestamp.format("%Y%m%dT%H%M%S%6f")
        );
        loop {
            let n = self.key_counter.fetch_add(1, Ordering::Relaxed);
            let key = format!("{base}_{n}");
            if !self.store.exists(&key) {
                return key;
            }
        }
    }

    // --- Cleanup ---

    /// Run a retention pass against the current time.
    pub fn run_cleanup(&self) -> CleanupReport {
        self.run_cleanup_at(Utc::now())
    }

    /// Run a retention pass as if the current time were `now`.
    ///
    /// Removes expired records, then enforces the global session limit.
    /// Individual delete failures are counted and left for the next pass.
    pub fn run_cleanup_at(&self, now: DateTime<Utc>) -> CleanupReport {
        let _gate = self.sweep_gate.write();

        let mut report = self
            .retention
            .sweep_expired(&self.index, self.store.as_ref(), now);
        let over_capacity = self
            .retention
            .enforce_global_cap(&self.index, self.store.as_ref());
        report.absorb(&over_capacity);

        // Every lock holder also holds the gate, so none is in use here.
        self.user_locks
            .lock()
            .retain(|user_id, _| self.index.has_records(user_id));

        tracing::info!(
            removed = report.removed_records,
            freed_bytes = report.freed_bytes,
            failed = report.failed_deletes,
            over_capacity = report.evicted_over_capacity,
            "cleanup finished"
        );
        report
    }

    // --- Reporting ---

    /// Aggregate statistics over the index.
    pub fn stats(&self) -> EngineStats {
        let totals = self.index.totals();
        EngineStats {
            total_users: totals.users,
            total_sessions: totals.sessions,
            total_bytes: totals.bytes,
            avg_sessions_per_user: totals.avg_sessions_per_user(),
            oldest_timestamp: totals.oldest,
            newest_timestamp: totals.newest,
            config: self.config.clone(),
        }
    }

    /// Records stored for a user, newest first.
    pub fn records_for(&self, user_id: &str) -> Vec<SessionRecord> {
        self.index.records(user_id)
    }

    /// Read back a persisted snapshot.
    pub fn load_snapshot(&self, key: &str) -> Result<Option<SessionSnapshot>> {
        match self.store.get(key)? {
            Some(payload) => serde_json::from_slice(&payload)
                .map(Some)
                .map_err(|e| DedupError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Discard the index and rebuild it from the store.
    pub fn rebuild_index(&self) -> Result<RebuildSummary> {
        let _gate = self.sweep_gate.write();
        let (rebuilt, summary) =
            SessionIndex::rebuild(self.store.as_ref(), |key| self.config.is_excluded(key))?;
        self.index.replace_all(rebuilt);
        self.apply_user_caps();
        Ok(summary)
    }
}

/// Keep a user id usable inside a storage key.
fn sanitize_key_component(user_id: &str) -> String {
    user_id
        .chars()
        .take(MAX_KEY_USER_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySnapshotStore;
    use serde_json::json;

    fn engine() -> SessionEngine {
        SessionEngine::with_store(EngineConfig::default(), Arc::new(MemorySnapshotStore::new()))
            .unwrap()
    }

    fn snapshot(value: serde_json::Value) -> SessionSnapshot {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_sanitize_key_component() {
        assert_eq!(sanitize_key_component("user@example.com"), "user_example_com");
        assert_eq!(sanitize_key_component("a-b_c9"), "a-b_c9");
        assert_eq!(sanitize_key_component(&"x".repeat(100)).len(), MAX_KEY_USER_LEN);
    }

    #[test]
    fn test_generated_keys_are_unique() {
        let engine = engine();
        let ts = Utc::now();
        let a = engine.next_key("u", ts);
        let b = engine.next_key("u", ts);
        assert_ne!(a, b);
        assert!(a.starts_with("session_u_"));
    }

    #[test]
    fn test_rejects_missing_user() {
        let engine = engine();
        let result = engine.process_snapshot(snapshot(json!({"timestamp": "2024-05-01T10:00:00Z"})));
        assert!(matches!(result, Err(DedupError::MalformedSnapshot(_))));
        assert_eq!(engine.stats().total_sessions, 0);
    }

    #[test]
    fn test_capture_older_than_full_list_is_not_stored() {
        let store = Arc::new(MemorySnapshotStore::new());
        let config = EngineConfig {
            max_sessions_per_user: 2,
            ..Default::default()
        };
        let engine = SessionEngine::with_store(config, store.clone()).unwrap();
        let variant = |n: u32, ts: &str| {
            snapshot(json!({
                "userId": "u",
                "timestamp": ts,
                "userInfo": {"n": n},
                "localStorage": {"n": n},
                "sessionStorage": {"n": n}
            }))
        };

        engine.process_snapshot(variant(1, "2024-05-01T10:00:00Z")).unwrap();
        engine.process_snapshot(variant(2, "2024-05-01T11:00:00Z")).unwrap();
        let before = engine.records_for("u");

        let late = engine.process_snapshot(variant(3, "2024-05-01T09:00:00Z")).unwrap();
        assert!(!late.saved);
        assert_eq!(late.action, ProcessAction::Skipped);
        assert!(late.key.is_none());
        assert_eq!(engine.records_for("u"), before);
        assert_eq!(store.len(), 2);

        // With room left, an older capture is still stored.
        let roomy = EngineConfig {
            max_sessions_per_user: 3,
            ..Default::default()
        };
        let engine = SessionEngine::with_store(roomy, Arc::new(MemorySnapshotStore::new())).unwrap();
        engine.process_snapshot(variant(1, "2024-05-01T10:00:00Z")).unwrap();
        engine.process_snapshot(variant(2, "2024-05-01T11:00:00Z")).unwrap();
        let outcome = engine.process_snapshot(variant(3, "2024-05-01T09:00:00Z")).unwrap();
        assert_eq!(outcome.action, ProcessAction::Created);
        let key = outcome.key.unwrap();
        assert!(engine.records_for("u").iter().any(|r| r.key == key));
    }

    #[test]
    fn test_cleanup_prunes_locks_of_users_without_records() {
        let engine = engine();
        engine
            .process_snapshot(SessionSnapshot::new("gone", "2020-01-01T00:00:00Z"))
            .unwrap();
        engine
            .process_snapshot(SessionSnapshot::new("kept", &Utc::now().to_rfc3339()))
            .unwrap();
        assert_eq!(engine.user_locks.lock().len(), 2);

        let report = engine.run_cleanup();
        assert_eq!(report.removed_records, 1);
        let locks = engine.user_locks.lock();
        assert_eq!(locks.len(), 1);
        assert!(locks.contains_key("kept"));
    }

    #[test]
    fn test_merge_of_missing_record_fails_without_index_change() {
        let store = Arc::new(MemorySnapshotStore::new());
        let engine =
            SessionEngine::with_store(EngineConfig::default(), store.clone()).unwrap();

        let first = engine
            .process_snapshot(SessionSnapshot::new("u", "2024-05-01T10:00:00Z"))
            .unwrap();
        let key = first.key.unwrap();
        store.delete(&key).unwrap();

        let result = engine.process_snapshot(SessionSnapshot::new("u", "2024-05-01T11:00:00Z"));
        assert!(matches!(result, Err(DedupError::RecordNotFound(_))));
        let records = engine.records_for("u");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }
}
