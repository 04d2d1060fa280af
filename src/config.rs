//! Engine configuration.

use crate::error::{DedupError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Longest retention window accepted, in days.
pub const MAX_RETENTION_DAYS: u32 = 365_000;

/// Engine configuration.
///
/// Every field has a default, so a config file only needs the values it
/// overrides.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Directory holding persisted snapshots.
    pub path: PathBuf,

    /// Number of decoded records kept in the read cache.
    pub cache_size: usize,

    /// Whether to initialize the store directory if it has no manifest.
    pub create_if_missing: bool,

    /// Records kept per user; the oldest beyond this are evicted.
    pub max_sessions_per_user: usize,

    /// Records kept across all users, enforced at the end of each cleanup.
    /// `0` disables the limit.
    pub max_total_sessions: usize,

    /// Records older than this many days are removed by cleanup.
    pub retention_days: u32,

    /// Period of the background cleanup.
    pub cleanup_interval_ms: u64,

    /// Minimum fractional dissimilarity (0..=1) that justifies a new record.
    pub significant_change_threshold: f64,

    /// Stamp snapshots without a timestamp with the ingestion time instead
    /// of rejecting them.
    pub default_missing_timestamp: bool,

    /// Run one cleanup as soon as the scheduler starts.
    pub cleanup_on_start: bool,

    /// Keys that are never indexed nor removed.
    pub excluded_keys: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./sessions"),
            cache_size: 256,
            create_if_missing: true,
            max_sessions_per_user: 10,
            max_total_sessions: 1000,
            retention_days: 30,
            cleanup_interval_ms: 60 * 60 * 1000,
            significant_change_threshold: 0.15,
            default_missing_timestamp: false,
            cleanup_on_start: true,
            excluded_keys: vec!["current-session".into(), "active-session-config".into()],
        }
    }
}

impl EngineConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read(path.as_ref())?;
        let config: EngineConfig = serde_json::from_slice(&raw)
            .map_err(|e| DedupError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.significant_change_threshold) {
            return Err(DedupError::InvalidConfig(format!(
                "significantChangeThreshold must be within 0..=1, got {}",
                self.significant_change_threshold
            )));
        }
        if self.max_sessions_per_user == 0 {
            return Err(DedupError::InvalidConfig(
                "maxSessionsPerUser must be at least 1".into(),
            ));
        }
        if self.retention_days > MAX_RETENTION_DAYS {
            return Err(DedupError::InvalidConfig(format!(
                "retentionDays must be at most {MAX_RETENTION_DAYS}, got {}",
                self.retention_days
            )));
        }
        if self.cleanup_interval_ms == 0 {
            return Err(DedupError::InvalidConfig(
                "cleanupIntervalMs must be positive".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn is_excluded(&self, key: &str) -> bool {
        self.excluded_keys.iter().any(|k| k == key)
    }
}
