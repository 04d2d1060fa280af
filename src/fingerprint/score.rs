//! Fingerprint similarity.

use super::builder::Fingerprint;

/// Number of per-field digests compared by [`similarity`].
pub const COMPARED_FIELDS: usize = 4;

/// Fraction of matching per-field digests, in steps of 0.25.
///
/// Fingerprints of different users are never similar. The core digest is
/// not compared here.
pub fn similarity(a: &Fingerprint, b: &Fingerprint) -> f64 {
    if a.user_id != b.user_id {
        return 0.0;
    }

    let matches = [
        a.user_info_hash == b.user_info_hash,
        a.local_storage_hash == b.local_storage_hash,
        a.session_storage_hash == b.session_storage_hash,
        a.metadata_hash == b.metadata_hash,
    ]
    .into_iter()
    .filter(|&equal| equal)
    .count();

    matches as f64 / COMPARED_FIELDS as f64
}
