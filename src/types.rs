//! Core types for the deduplication engine.

use crate::config::EngineConfig;
use crate::error::{DedupError, Result};
use crate::fingerprint::Fingerprint;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::fmt;

/// Content digest (SHA-256) of a canonicalized JSON value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// Compute hash from bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentHash(hasher.finalize().into())
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({}...)", &self.to_hex()[..8])
    }
}

/// One captured copy of a user's browser-session state.
///
/// This is both the ingestion shape and the persisted shape: a stored record
/// is a snapshot, possibly folded together from several merges. Top-level
/// fields the engine does not know about are carried in `extra` and survive
/// merges untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    #[serde(default)]
    pub user_id: String,

    /// ISO-8601 capture time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    #[serde(default)]
    pub user_info: Map<String, Value>,

    #[serde(default)]
    pub local_storage: Map<String, Value>,

    #[serde(default)]
    pub session_storage: Map<String, Value>,

    #[serde(default)]
    pub metadata: Map<String, Value>,

    /// Opaque cookie jar. Never part of any fingerprint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookies: Option<Vec<Value>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SessionSnapshot {
    /// Create a snapshot for a user captured at `timestamp`.
    pub fn new(user_id: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            timestamp: Some(timestamp.into()),
            ..Default::default()
        }
    }

    /// Parse a snapshot from raw JSON bytes.
    ///
    /// Anything that is not a JSON object of the expected shape is reported
    /// as a malformed snapshot.
    pub fn from_json(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|e| DedupError::MalformedSnapshot(e.to_string()))
    }

    /// Check the required fields and resolve the capture time.
    ///
    /// A missing timestamp is rejected unless `default_missing` is set, in
    /// which case `now` is written into the snapshot and returned.
    pub fn validate(&mut self, default_missing: bool, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        if self.user_id.trim().is_empty() {
            return Err(DedupError::MalformedSnapshot("missing userId".into()));
        }

        if let Some(raw) = self.timestamp.as_deref() {
            return parse_timestamp(raw);
        }
        if !default_missing {
            return Err(DedupError::MalformedSnapshot("missing timestamp".into()));
        }
        self.timestamp = Some(format_timestamp(now));
        Ok(now)
    }

    /// Serialized size in bytes.
    pub fn encoded_len(&self) -> Result<u64> {
        let bytes = serde_json::to_vec(self).map_err(|e| DedupError::Serialization(e.to_string()))?;
        Ok(bytes.len() as u64)
    }
}

/// Parse an ISO-8601 / RFC 3339 capture timestamp.
///
/// Fractional seconds beyond nanosecond precision are truncated and a
/// timestamp without an offset is read as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let trimmed = truncate_fraction(raw.trim());

    if let Ok(dt) = DateTime::parse_from_rfc3339(&trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&trimmed, format) {
            return Ok(naive.and_utc());
        }
    }

    Err(DedupError::InvalidTimestamp(raw.to_string()))
}

/// Format a timestamp the way the engine writes it into snapshots.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn truncate_fraction(raw: &str) -> Cow<'_, str> {
    let Some(dot) = raw.find('.') else {
        return Cow::Borrowed(raw);
    };
    let digits = raw[dot + 1..]
        .bytes()
        .take_while(|b| b.is_ascii_digit())
        .count();
    if digits <= 9 {
        return Cow::Borrowed(raw);
    }
    Cow::Owned(format!("{}{}", &raw[..dot + 10], &raw[dot + 1 + digits..]))
}

/// Descriptor of one physically persisted snapshot.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionRecord {
    /// Storage key. Stable across merges.
    pub key: String,
    pub timestamp: DateTime<Utc>,
    pub fingerprint: Fingerprint,
    pub size_bytes: u64,
}

impl SessionRecord {
    pub fn user_id(&self) -> &str {
        &self.fingerprint.user_id
    }
}

/// What `process_snapshot` did with a snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessAction {
    Created,
    Merged,
    Skipped,
}

impl fmt::Display for ProcessAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessAction::Created => "created",
            ProcessAction::Merged => "merged",
            ProcessAction::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Result of processing one snapshot.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOutcome {
    pub saved: bool,
    pub action: ProcessAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub reason: String,
    /// Bytes that did not become a new physical record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_saved: Option<u64>,
}

/// Totals from one cleanup pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub removed_records: u64,
    pub freed_bytes: u64,
    /// Deletes that failed and were left for a later pass.
    pub failed_deletes: u64,
    /// Records removed by the global capacity limit (included in `removed_records`).
    pub evicted_over_capacity: u64,
}

impl CleanupReport {
    pub(crate) fn absorb(&mut self, other: &CleanupReport) {
        self.removed_records += other.removed_records;
        self.freed_bytes += other.freed_bytes;
        self.failed_deletes += other.failed_deletes;
        self.evicted_over_capacity += other.evicted_over_capacity;
    }
}

/// Aggregate view over the index.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub total_users: u64,
    pub total_sessions: u64,
    pub total_bytes: u64,
    /// Rounded to one decimal place.
    pub avg_sessions_per_user: f64,
    pub oldest_timestamp: Option<DateTime<Utc>>,
    pub newest_timestamp: Option<DateTime<Utc>>,
    pub config: EngineConfig,
}
