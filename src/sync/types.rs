//! Sync result and error types.
//!
//! Every run produces a report, including runs that fail, are declined or
//! are cancelled. Errors that stop a run are carried next to the counts
//! gathered so far rather than replacing them.

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::model::PartitionKey;
use crate::source::FetchError;

/// Counts from reconciling one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// One message per unit that failed validation.
    pub errors: Vec<String>,
    /// Partitions with at least one unit reconciled successfully.
    #[serde(skip)]
    pub synced_partitions: BTreeSet<PartitionKey>,
}

impl ReconcileStats {
    /// Whether the store was changed.
    #[must_use]
    pub fn any_changes(&self) -> bool {
        self.created + self.updated + self.deleted > 0
    }
}

/// A storage failure part-way through reconciliation.
#[derive(Debug, thiserror::Error)]
#[error("reconciliation stopped after {} creates, {} updates: {error}", .stats.created, .stats.updated)]
pub struct PartialFailure {
    /// Work attempted before the failure.
    pub stats: ReconcileStats,
    pub error: crate::error::Error,
}

/// Counts from purging removed partitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeStats {
    pub notes_removed: usize,
    pub decks_removed: usize,
    pub note_types_removed: usize,
}

/// Result of name enforcement for one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NameEnforcement {
    pub deck_renamed: bool,
    /// Ids of note types renamed in place.
    pub note_types_renamed: Vec<i64>,
    /// Side-table entries pointing at note types that no longer exist.
    pub orphans_dropped: usize,
    /// Renames that could not be applied.
    pub errors: Vec<String>,
}

impl NameEnforcement {
    pub fn merge(&mut self, other: Self) {
        self.deck_renamed |= other.deck_renamed;
        self.note_types_renamed.extend(other.note_types_renamed);
        self.orphans_dropped += other.orphans_dropped;
        self.errors.extend(other.errors);
    }
}

/// Final state of one collection within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// Everything ran and was rolled back.
    DryRun,
    FetchFailed,
    /// Rolled back after a storage error.
    StorageFailed,
    /// Rolled back because the purge plan changed after confirmation.
    Stale,
    /// The batch was declined at the purge confirmation.
    Declined,
    /// Cancelled before this collection started.
    Cancelled,
    /// Not attempted because an earlier collection aborted the batch.
    Skipped,
}

impl RunStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::DryRun => "dry_run",
            Self::FetchFailed => "fetch_failed",
            Self::StorageFailed => "storage_failed",
            Self::Stale => "stale",
            Self::Declined => "declined",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        }
    }
}

/// Report for one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub collection_id: String,
    /// Remote name the run used for naming.
    pub remote_name: Option<String>,
    pub status: RunStatus,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Rows and row/student pairs that produced no unit.
    pub ignored: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub purged: PurgeStats,
    /// Labels of the partitions purged.
    pub purged_partitions: Vec<String>,
    /// Student names seen for the first time.
    pub discovered: Vec<String>,
    pub names: NameEnforcement,
    pub dry_run: bool,
}

impl SyncReport {
    #[must_use]
    pub fn new(collection_id: &str) -> Self {
        Self {
            collection_id: collection_id.to_string(),
            remote_name: None,
            status: RunStatus::Completed,
            created: 0,
            updated: 0,
            deleted: 0,
            ignored: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            purged: PurgeStats::default(),
            purged_partitions: Vec::new(),
            discovered: Vec::new(),
            names: NameEnforcement::default(),
            dry_run: false,
        }
    }

    /// Report for a collection that never reached the write phase.
    #[must_use]
    pub fn with_status(collection_id: &str, status: RunStatus, error: Option<String>) -> Self {
        let mut report = Self::new(collection_id);
        report.status = status;
        report.errors.extend(error);
        report
    }

    /// Copy reconciliation counts into the report.
    pub fn apply_stats(&mut self, stats: &ReconcileStats) {
        self.created = stats.created;
        self.updated = stats.updated;
        self.deleted = stats.deleted;
        self.errors.extend(stats.errors.iter().cloned());
    }
}

/// How a batch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    Completed,
    Cancelled,
    /// Purge confirmation was declined; nothing was written.
    Declined,
    /// A storage failure stopped the batch.
    Aborted,
}

/// Reports for every collection requested in one batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub run_id: String,
    pub outcome: BatchOutcome,
    pub reports: Vec<SyncReport>,
    /// Cause of a non-completed outcome.
    pub error: Option<String>,
}

impl BatchReport {
    #[must_use]
    pub fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            outcome: BatchOutcome::Completed,
            reports: Vec::new(),
            error: None,
        }
    }

    /// Reports of collections whose fetch failed.
    pub fn fetch_failures(&self) -> impl Iterator<Item = &SyncReport> {
        self.reports
            .iter()
            .filter(|r| r.status == RunStatus::FetchFailed)
    }
}

/// Errors that stop a collection or a batch.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The local store failed; the collection was rolled back.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("failed to fetch collection {collection}: {source}")]
    Fetch {
        collection: String,
        source: FetchError,
    },

    #[error("purge declined for {}", .collections.join(", "))]
    ConfirmationDeclined { collections: Vec<String> },

    #[error("sync cancelled before {}", .remaining.join(", "))]
    Cancelled { remaining: Vec<String> },

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("purge plan for {collection} changed since it was confirmed; run sync again")]
    PlanChanged { collection: String },
}

impl From<crate::error::Error> for SyncError {
    fn from(err: crate::error::Error) -> Self {
        match err {
            crate::error::Error::Sync(inner) => inner,
            other => Self::Storage(other.to_string()),
        }
    }
}

/// Shared flag for cancelling a batch between collections.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_sync_error_from_crate_error_unwraps_sync() {
        let inner = crate::error::Error::Sync(SyncError::CollectionNotFound("bio".into()));
        assert!(matches!(SyncError::from(inner), SyncError::CollectionNotFound(_)));

        let db = crate::error::Error::Config("boom".into());
        assert!(matches!(SyncError::from(db), SyncError::Storage(_)));
    }

    #[test]
    fn test_report_serializes_status_snake_case() {
        let report = SyncReport::with_status("bio", RunStatus::FetchFailed, Some("gone".into()));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "fetch_failed");
        assert_eq!(json["errors"][0], "gone");
    }
}
