//! Reconciliation of remote collections into the local store.
//!
//! This module makes the local notes, decks and note types of a collection
//! track its remote rows:
//!
//! - **Partition**: rows → one unit per (row, enabled student)
//! - **Reconcile**: units → created / updated / deleted notes
//! - **Names**: deck and note-type names follow the remote collection name
//! - **Cleanup**: confirmed purge of students no longer enabled
//! - **Engine**: the batch driver tying the above together under a write lock
//!
//! # Example
//!
//! ```ignore
//! use decksync::source::JsonFileSource;
//! use decksync::sync::{AssumeYes, SyncEngine};
//!
//! let mut engine = SyncEngine::new(&mut storage, JsonFileSource::new());
//! let report = engine.run_sync("biology", &mut AssumeYes);
//! println!("{} created, {} updated", report.created, report.updated);
//! ```

pub mod cleanup;
pub mod engine;
pub mod hash;
pub mod names;
pub mod partition;
pub mod reconcile;
pub mod types;

pub use cleanup::{AssumeYes, ConfirmPurge, PurgePlan, detect_removed_partitions};
pub use engine::{SyncEngine, SyncStore};
pub use hash::{content_hash, note_guid};
pub use names::{CanonicalNames, enforce_collection_names, enforce_names, root_deck_conflict};
pub use partition::{ConfigurationError, Partitioned, partition, split_students};
pub use reconcile::reconcile;
pub use types::{
    BatchOutcome, BatchReport, CancelToken, NameEnforcement, PartialFailure, PurgeStats,
    ReconcileStats, RunStatus, SyncError, SyncReport,
};
