//! Content fingerprints for session snapshots.
//!
//! A snapshot is normalized (volatile keys dropped), each comparable
//! sub-object is canonicalized with object keys sorted at every level, and
//! the canonical JSON is hashed. Cookies never take part.

mod builder;
mod normalize;
mod score;

pub use builder::{build_fingerprint, canonicalize, Fingerprint};
pub use normalize::{normalize_metadata, normalize_storage};
pub use score::{similarity, COMPARED_FIELDS};
