//! # Session Snapshot Deduplication
//!
//! Absorbs a high-frequency stream of near-duplicate browser session
//! snapshots and stores them economically.
//!
//! ## Core Concepts
//!
//! - **Fingerprints**: per-field content digests of a normalized snapshot,
//!   with volatile keys (timestamps, expiries) and cookies ignored
//! - **Decisions**: each snapshot is compared with the user's newest record
//!   and is created, merged into it, or skipped
//! - **Retention**: a per-user cap after every create, plus a periodic sweep
//!   for expired records and the global session limit
//! - **Index**: an in-memory projection of the store, rebuilt on startup
//!
//! ## Example
//!
//! ```ignore
//! use session_dedup::{CleanupScheduler, EngineConfig, SessionEngine, SessionSnapshot};
//! use std::sync::Arc;
//!
//! let engine = Arc::new(SessionEngine::open(EngineConfig {
//!     path: "./sessions".into(),
//!     ..Default::default()
//! })?);
//!
//! let outcome = engine.process_snapshot(SessionSnapshot::new("100", "2024-05-01T10:00:00Z"))?;
//! println!("{} ({})", outcome.action, outcome.reason);
//!
//! let mut scheduler = CleanupScheduler::new(Arc::clone(&engine));
//! scheduler.start()?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod index;
pub mod merge;
pub mod policy;
pub mod retention;
pub mod scheduler;
pub mod storage;
pub mod types;

// Re-exports
pub use config::EngineConfig;
pub use engine::SessionEngine;
pub use error::{DedupError, Result};
pub use fingerprint::{build_fingerprint, similarity, Fingerprint};
pub use index::{IndexTotals, RebuildSummary, SessionIndex};
pub use merge::merge_snapshots;
pub use policy::{decide, is_significant_change, Decision};
pub use retention::RetentionManager;
pub use scheduler::CleanupScheduler;
pub use storage::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
pub use types::*;
