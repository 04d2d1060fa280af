//! Create / merge / skip decision for an incoming snapshot.
//!
//! Only the newest stored record of the user is consulted, which keeps the
//! cost of an ingestion bounded regardless of history length. A skipped
//! snapshot is discarded entirely.

use crate::fingerprint::{similarity, Fingerprint};
use crate::types::SessionRecord;

/// Outcome of the decision policy.
#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    /// Persist the snapshot as a new record.
    Create { reason: String },
    /// Fold the snapshot into an existing record.
    Merge { target_key: String, reason: String },
    /// Drop the snapshot.
    Skip { reason: String },
}

impl Decision {
    pub fn reason(&self) -> &str {
        match self {
            Decision::Create { reason }
            | Decision::Merge { reason, .. }
            | Decision::Skip { reason } => reason,
        }
    }
}

/// Whether a similarity score is a significant change under `threshold`.
///
/// The comparison is strict: with a threshold of 0.15 a score of exactly
/// 0.85 is not significant.
pub fn is_significant_change(similarity: f64, threshold: f64) -> bool {
    similarity < 1.0 - threshold
}

/// Decide what to do with a snapshot fingerprinted as `incoming`, given the
/// user's newest stored record.
pub fn decide(incoming: &Fingerprint, latest: Option<&SessionRecord>, threshold: f64) -> Decision {
    let Some(latest) = latest else {
        return Decision::Create {
            reason: "first record for user".into(),
        };
    };

    if incoming.core_data_hash == latest.fingerprint.core_data_hash {
        return Decision::Merge {
            target_key: latest.key.clone(),
            reason: "core data unchanged".into(),
        };
    }

    let score = similarity(incoming, &latest.fingerprint);
    let change = (1.0 - score) * 100.0;

    if is_significant_change(score, threshold) {
        Decision::Create {
            reason: format!("significant change ({change:.1}% of fields differ)"),
        }
    } else {
        Decision::Skip {
            reason: format!(
                "change below threshold ({change:.1}% < {:.1}%)",
                threshold * 100.0
            ),
        }
    }
}
