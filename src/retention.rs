//! Retention: per-user caps, time-based expiry and the global capacity limit.
//!
//! Deletions that fail are logged and the record stays indexed, so the next
//! pass retries it.

use crate::config::EngineConfig;
use crate::index::SessionIndex;
use crate::storage::SnapshotStore;
use crate::types::{CleanupReport, SessionRecord};
use chrono::{DateTime, Duration, Utc};

/// Limits applied by the retention manager.
#[derive(Clone, Debug)]
pub struct RetentionManager {
    max_sessions_per_user: usize,
    max_total_sessions: usize,
    retention: Duration,
}

impl RetentionManager {
    pub fn new(max_sessions_per_user: usize, max_total_sessions: usize, retention_days: u32) -> Self {
        Self {
            max_sessions_per_user,
            max_total_sessions,
            retention: Duration::days(i64::from(retention_days)),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.max_sessions_per_user,
            config.max_total_sessions,
            config.retention_days,
        )
    }

    /// Oldest timestamp a record may carry and survive a sweep at `now`.
    ///
    /// `None` when the window reaches past the earliest representable time,
    /// in which case nothing expires.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        now.checked_sub_signed(self.retention)
    }

    /// Evict a user's records beyond the per-user cap, oldest first.
    ///
    /// Evicted records leave the index even when their delete fails, so the
    /// cap always holds; a rebuild picks up and re-trims any leftover.
    pub fn enforce_user_cap(
        &self,
        index: &SessionIndex,
        store: &dyn SnapshotStore,
        user_id: &str,
    ) -> CleanupReport {
        let excess = index.excess(user_id, self.max_sessions_per_user);
        let mut report = CleanupReport::default();
        if excess.is_empty() {
            return report;
        }

        let keys: Vec<String> = excess.iter().map(|r| r.key.clone()).collect();
        for record in index.remove_keys(user_id, &keys) {
            match store.delete(&record.key) {
                Ok(_) => {
                    report.removed_records += 1;
                    report.freed_bytes += record.size_bytes;
                }
                Err(e) => {
                    tracing::warn!(
                        user_id,
                        key = %record.key,
                        error = %e,
                        "failed to delete record evicted by per-user cap"
                    );
                    report.failed_deletes += 1;
                }
            }
        }

        tracing::debug!(
            user_id,
            evicted = report.removed_records,
            cap = self.max_sessions_per_user,
            "per-user cap enforced"
        );
        report
    }

    /// Delete every record older than the retention window.
    ///
    /// Decisions are made against a copy of the index taken at the start,
    /// and only the keys actually deleted are removed afterwards, so records
    /// added meanwhile are never touched.
    pub fn sweep_expired(
        &self,
        index: &SessionIndex,
        store: &dyn SnapshotStore,
        now: DateTime<Utc>,
    ) -> CleanupReport {
        let mut report = CleanupReport::default();
        let Some(cutoff) = self.cutoff(now) else {
            return report;
        };

        for (user_id, records) in index.snapshot() {
            let expired: Vec<&SessionRecord> =
                records.iter().filter(|r| r.timestamp < cutoff).collect();
            if expired.is_empty() {
                continue;
            }

            let deleted = delete_all(store, &expired, &mut report);
            index.remove_keys(&user_id, &deleted);
        }

        report
    }

    /// Evict globally-oldest records until the total is within
    /// `max_total_sessions`. A limit of zero disables this.
    pub fn enforce_global_cap(&self, index: &SessionIndex, store: &dyn SnapshotStore) -> CleanupReport {
        let mut report = CleanupReport::default();
        if self.max_total_sessions == 0 {
            return report;
        }

        let total = index.count();
        if total <= self.max_total_sessions {
            return report;
        }

        let mut all: Vec<SessionRecord> = index.snapshot().into_values().flatten().collect();
        all.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        let overflow: Vec<&SessionRecord> = all.iter().take(total - self.max_total_sessions).collect();

        let mut by_user: std::collections::HashMap<&str, Vec<&SessionRecord>> =
            std::collections::HashMap::new();
        for record in overflow {
            by_user.entry(record.user_id()).or_default().push(record);
        }

        for (user_id, records) in by_user {
            let deleted = delete_all(store, &records, &mut report);
            report.evicted_over_capacity += deleted.len() as u64;
            index.remove_keys(user_id, &deleted);
        }

        tracing::info!(
            evicted = report.evicted_over_capacity,
            limit = self.max_total_sessions,
            "global session limit enforced"
        );
        report
    }
}

/// Delete each record, returning the keys that are gone from the store.
fn delete_all(
    store: &dyn SnapshotStore,
    records: &[&SessionRecord],
    report: &mut CleanupReport,
) -> Vec<String> {
    let mut deleted = Vec::with_capacity(records.len());
    for record in records {
        match store.delete(&record.key) {
            Ok(_) => {
                report.removed_records += 1;
                report.freed_bytes += record.size_bytes;
                deleted.push(record.key.clone());
            }
            Err(e) => {
                tracing::warn!(key = %record.key, error = %e, "failed to delete expired record, will retry");
                report.failed_deletes += 1;
            }
        }
    }
    deleted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::build_fingerprint;
    use crate::storage::MemorySnapshotStore;
    use crate::types::SessionSnapshot;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn add(index: &SessionIndex, store: &MemorySnapshotStore, user: &str, key: &str, age_hours: i64) {
        let snapshot = SessionSnapshot::new(user, "2024-05-01T10:00:00Z");
        store.put(key, b"0123456789").unwrap();
        index.insert(SessionRecord {
            key: key.into(),
            timestamp: now() - Duration::hours(age_hours),
            fingerprint: build_fingerprint(&snapshot),
            size_bytes: 10,
        });
    }

    #[test]
    fn test_user_cap_evicts_oldest() {
        let index = SessionIndex::new();
        let store = MemorySnapshotStore::new();
        for (key, age) in [("a", 4), ("b", 3), ("c", 2), ("d", 1)] {
            add(&index, &store, "u", key, age);
        }

        let report = RetentionManager::new(2, 0, 30).enforce_user_cap(&index, &store, "u");

        assert_eq!(report.removed_records, 2);
        assert_eq!(report.freed_bytes, 20);
        let kept: Vec<String> = index.records("u").into_iter().map(|r| r.key).collect();
        assert_eq!(kept, vec!["d", "c"]);
        assert!(!store.exists("a"));
        assert!(!store.exists("b"));
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let index = SessionIndex::new();
        let store = MemorySnapshotStore::new();
        add(&index, &store, "u1", "old", 24 * 3);
        add(&index, &store, "u1", "fresh", 1);
        add(&index, &store, "u2", "older", 24 * 10);

        let report = RetentionManager::new(10, 0, 2).sweep_expired(&index, &store, now());

        assert_eq!(report.removed_records, 2);
        assert_eq!(report.freed_bytes, 20);
        assert_eq!(index.count(), 1);
        assert_eq!(index.latest("u1").unwrap().key, "fresh");
        assert!(index.records("u2").is_empty());
    }

    #[test]
    fn test_sweep_with_zero_retention_removes_past_records() {
        let index = SessionIndex::new();
        let store = MemorySnapshotStore::new();
        add(&index, &store, "u", "yesterday", 24);

        let report = RetentionManager::new(10, 0, 0).sweep_expired(&index, &store, now());
        assert_eq!(report.removed_records, 1);
        assert_eq!(report.freed_bytes, 10);
    }

    #[test]
    fn test_sweep_with_unrepresentable_cutoff_keeps_everything() {
        let index = SessionIndex::new();
        let store = MemorySnapshotStore::new();
        add(&index, &store, "u", "ancient", 24 * 365 * 100);

        let retention = RetentionManager::new(10, 0, u32::MAX);
        assert!(retention.cutoff(now()).is_none());

        let report = retention.sweep_expired(&index, &store, now());
        assert_eq!(report, CleanupReport::default());
        assert_eq!(index.count(), 1);
        assert!(store.exists("ancient"));
    }

    #[test]
    fn test_global_cap_evicts_oldest_across_users() {
        let index = SessionIndex::new();
        let store = MemorySnapshotStore::new();
        add(&index, &store, "u1", "a", 5);
        add(&index, &store, "u2", "b", 4);
        add(&index, &store, "u1", "c", 3);
        add(&index, &store, "u2", "d", 2);

        let report = RetentionManager::new(10, 2, 30).enforce_global_cap(&index, &store);

        assert_eq!(report.evicted_over_capacity, 2);
        assert_eq!(report.removed_records, 2);
        assert_eq!(index.count(), 2);
        assert!(!store.exists("a"));
        assert!(!store.exists("b"));
        assert!(store.exists("c"));
    }

    #[test]
    fn test_global_cap_zero_is_disabled() {
        let index = SessionIndex::new();
        let store = MemorySnapshotStore::new();
        add(&index, &store, "u1", "a", 5);

        let report = RetentionManager::new(10, 0, 30).enforce_global_cap(&index, &store);
        assert_eq!(report, CleanupReport::default());
        assert_eq!(index.count(), 1);
    }
}
