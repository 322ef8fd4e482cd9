//! Sync engine.
//!
//! Drives a batch of collections through three phases:
//!
//! 1. **Prepare**: load each collection, fetch its rows and plan its purge.
//!    Nothing is written and no lock is held.
//! 2. **Confirm**: every non-empty purge plan of the batch is shown to the
//!    confirmation gate at once. Declining stops the whole batch before any
//!    write.
//! 3. **Write**: each collection runs inside its own write lock. The student
//!    registry is read again under the lock and the purge plan recomputed;
//!    a plan that no longer matches the confirmed one rolls the collection
//!    back as stale. Then: rename detection, name enforcement, purge,
//!    partition, reconcile, name enforcement again, registry save. The lock
//!    is committed, or rolled back on a storage error (which also stops the
//!    batch) or in dry-run mode.
//!
//! Cancellation is checked between collections, never inside one.

use crate::error::{Error, Result};
use crate::model::Collection;
use crate::source::{RemoteSheet, RowSource};
use crate::storage::{ConfigStore, LocalStore, RunJournal, SyncRunRecord, WriteLock};
use crate::sync::cleanup::{self, ConfirmPurge, PurgePlan};
use crate::sync::names::{enforce_collection_names, root_deck_conflict};
use crate::sync::partition::partition;
use crate::sync::reconcile::reconcile;
use crate::sync::types::{
    BatchOutcome, BatchReport, CancelToken, RunStatus, SyncError, SyncReport,
};

/// Everything the local side needs from storage.
pub trait SyncStore: LocalStore + ConfigStore + WriteLock + RunJournal {}

impl<T: LocalStore + ConfigStore + WriteLock + RunJournal + ?Sized> SyncStore for T {}

/// A collection that passed the prepare phase.
struct Prepared {
    collection: Collection,
    sheet: RemoteSheet,
    /// The plan shown for confirmation.
    plan: PurgePlan,
}

enum Slot {
    Ready(Prepared),
    Done(SyncReport),
}

/// Runs sync batches against one store and one row source.
pub struct SyncEngine<'a, S: ?Sized, R> {
    store: &'a mut S,
    source: R,
    cancel: CancelToken,
    dry_run: bool,
}

impl<'a, S: SyncStore + ?Sized, R: RowSource> SyncEngine<'a, S, R> {
    pub fn new(store: &'a mut S, source: R) -> Self {
        Self {
            store,
            source,
            cancel: CancelToken::new(),
            dry_run: false,
        }
    }

    /// Use a shared cancellation token.
    #[must_use]
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Run everything, then roll back. Skips purge confirmation.
    #[must_use]
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Sync one collection. Always returns a report.
    pub fn run_sync(&mut self, collection_id: &str, confirm: &mut dyn ConfirmPurge) -> SyncReport {
        let batch = self.run_batch(&[collection_id.to_string()], confirm);
        batch.reports.into_iter().next().unwrap_or_else(|| {
            SyncReport::with_status(collection_id, RunStatus::Skipped, batch.error)
        })
    }

    /// Sync several collections in order.
    pub fn run_batch(
        &mut self,
        collection_ids: &[String],
        confirm: &mut dyn ConfirmPurge,
    ) -> BatchReport {
        let run_id = generate_run_id();
        let mut batch = BatchReport::new(&run_id);
        tracing::info!(run = %run_id, collections = collection_ids.len(), dry_run = self.dry_run, "Starting sync");

        // Prepare
        let mut slots = Vec::with_capacity(collection_ids.len());
        for id in collection_ids {
            match self.prepare(id) {
                Ok(slot) => slots.push(slot),
                Err(err) => {
                    tracing::error!(collection = %id, error = %err, "Failed to load collection");
                    return abort_before_writes(batch, collection_ids, id, &err.into());
                }
            }
        }

        // Confirm
        let plans: Vec<PurgePlan> = slots
            .iter()
            .filter_map(|slot| match slot {
                Slot::Ready(p) if !p.plan.is_empty() => Some(p.plan.clone()),
                _ => None,
            })
            .collect();
        if !plans.is_empty() && !self.dry_run && !confirm.confirm(&plans) {
            let declined = SyncError::ConfirmationDeclined {
                collections: plans.iter().map(|p| p.collection_id.clone()).collect(),
            };
            tracing::warn!(error = %declined, "Purge declined; nothing written");
            batch.outcome = BatchOutcome::Declined;
            batch.error = Some(declined.to_string());
            batch.reports = slots
                .into_iter()
                .map(|slot| match slot {
                    Slot::Ready(p) => {
                        SyncReport::with_status(&p.collection.id, RunStatus::Declined, None)
                    }
                    Slot::Done(report) => report,
                })
                .collect();
            return batch;
        }

        // Write
        let mut slots = slots.into_iter();
        while let Some(slot) = slots.next() {
            let prepared = match slot {
                Slot::Done(report) => {
                    batch.reports.push(report);
                    continue;
                }
                Slot::Ready(prepared) => prepared,
            };

            if self.cancel.is_cancelled() {
                let rest: Vec<SyncReport> = std::iter::once(Slot::Ready(prepared))
                    .chain(slots.by_ref())
                    .map(|slot| match slot {
                        Slot::Ready(p) => {
                            SyncReport::with_status(&p.collection.id, RunStatus::Cancelled, None)
                        }
                        Slot::Done(report) => report,
                    })
                    .collect();
                let cancelled = SyncError::Cancelled {
                    remaining: rest
                        .iter()
                        .filter(|r| r.status == RunStatus::Cancelled)
                        .map(|r| r.collection_id.clone())
                        .collect(),
                };
                tracing::warn!(error = %cancelled, "Sync cancelled");
                batch.reports.extend(rest);
                batch.outcome = BatchOutcome::Cancelled;
                batch.error = Some(cancelled.to_string());
                break;
            }

            let started_at = chrono::Utc::now().timestamp_millis();
            let report = self.write_collection(prepared);
            self.journal(&run_id, &report, started_at);

            let failed = report.status == RunStatus::StorageFailed;
            if failed {
                batch.error = report.errors.last().cloned();
            }
            batch.reports.push(report);

            if failed {
                batch.outcome = BatchOutcome::Aborted;
                batch.reports.extend(slots.by_ref().map(|slot| match slot {
                    Slot::Ready(p) => {
                        SyncReport::with_status(&p.collection.id, RunStatus::Skipped, None)
                    }
                    Slot::Done(report) => report,
                }));
                break;
            }
        }

        tracing::info!(run = %run_id, outcome = ?batch.outcome, "Sync finished");
        batch
    }

    fn prepare(&mut self, collection_id: &str) -> Result<Slot> {
        let Some(collection) = self.store.get_collection(collection_id)? else {
            let err = SyncError::CollectionNotFound(collection_id.to_string());
            return Ok(Slot::Done(SyncReport::with_status(
                collection_id,
                RunStatus::FetchFailed,
                Some(err.to_string()),
            )));
        };

        let sheet = match self.source.fetch(&collection.source) {
            Ok(sheet) => sheet,
            Err(source) => {
                let err = SyncError::Fetch {
                    collection: collection_id.to_string(),
                    source,
                };
                tracing::warn!(collection = collection_id, error = %err, "Fetch failed");
                return Ok(Slot::Done(SyncReport::with_status(
                    collection_id,
                    RunStatus::FetchFailed,
                    Some(err.to_string()),
                )));
            }
        };
        tracing::debug!(collection = collection_id, rows = sheet.rows.len(), "Fetched rows");

        let registry = self.store.load_registry(collection_id)?;
        let include_missing = self.store.missing_student_policy(collection_id)?;
        let plan = cleanup::plan(collection_id, &registry, include_missing);

        Ok(Slot::Ready(Prepared {
            collection,
            sheet,
            plan,
        }))
    }

    fn write_collection(&mut self, prepared: Prepared) -> SyncReport {
        let id = prepared.collection.id.clone();
        let mut report = SyncReport::new(&id);
        report.dry_run = self.dry_run;

        if let Err(err) = self.store.begin_write() {
            return storage_failed(report, &err);
        }

        match self.sync_collection(prepared, &mut report) {
            Ok(()) if self.dry_run => match self.store.rollback_write() {
                Ok(()) => report.status = RunStatus::DryRun,
                Err(err) => return storage_failed(report, &err),
            },
            Ok(()) => {
                if let Err(err) = self.store.commit_write() {
                    // Best effort; the commit error is the one reported
                    let _ = self.store.rollback_write();
                    return storage_failed(report, &err);
                }
            }
            Err(err) => {
                if let Err(rollback) = self.store.rollback_write() {
                    tracing::error!(collection = %id, error = %rollback, "Rollback failed");
                }
                if let Error::Sync(stale @ SyncError::PlanChanged { .. }) = &err {
                    tracing::warn!(collection = %id, error = %stale, "Collection rolled back");
                    let mut stale_report =
                        SyncReport::with_status(&id, RunStatus::Stale, Some(stale.to_string()));
                    stale_report.dry_run = self.dry_run;
                    return stale_report;
                }
                return storage_failed(report, &err);
            }
        }

        tracing::info!(
            collection = %id,
            created = report.created,
            updated = report.updated,
            deleted = report.deleted,
            ignored = report.ignored,
            errors = report.errors.len(),
            "Collection synced"
        );
        report
    }

    fn sync_collection(&mut self, prepared: Prepared, report: &mut SyncReport) -> Result<()> {
        let Prepared {
            collection,
            sheet,
            plan,
        } = prepared;
        let id = collection.id.as_str();

        let mut registry = self.store.load_registry(id)?;
        let include_missing = self.store.missing_student_policy(id)?;
        if cleanup::plan(id, &registry, include_missing) != plan {
            return Err(SyncError::PlanChanged {
                collection: id.to_string(),
            }
            .into());
        }

        let remote_name = self.detect_rename(id, sheet.title.as_deref())?;
        report.remote_name = Some(remote_name.clone());

        if let Some(conflict) = root_deck_conflict(&*self.store, id, &remote_name)? {
            tracing::warn!(collection = id, error = %conflict, "Skipping collection");
            report.names.errors.push(conflict.clone());
            report.errors.push(conflict);
            return Ok(());
        }

        report
            .names
            .merge(enforce_collection_names(&mut *self.store, id, &remote_name)?);

        if !plan.is_empty() {
            let purged = cleanup::execute(&mut *self.store, &plan, &remote_name)?;
            registry.forget(plan.partitions().iter());
            report.purged = purged;
            report.purged_partitions = plan.labels();
        }

        let split = partition(&sheet.rows, &registry.enabled, include_missing);
        report.ignored = split.ignored;
        report.discovered = registry.discover(split.discovered);
        if !report.discovered.is_empty() {
            tracing::info!(collection = id, students = ?report.discovered, "Discovered new students");
        }
        if let Some(warning) = split.warning {
            report.warnings.push(warning.to_string());
        }

        let stats = match reconcile(
            &mut *self.store,
            id,
            &remote_name,
            &split.units,
            &split.existing_row_ids,
        ) {
            Ok(stats) => stats,
            Err(failure) => {
                report.apply_stats(&failure.stats);
                return Err(failure.error);
            }
        };
        report.apply_stats(&stats);
        registry.record_synced(stats.synced_partitions.iter());

        report
            .names
            .merge(enforce_collection_names(&mut *self.store, id, &remote_name)?);
        report.errors.extend(report.names.errors.iter().cloned());

        self.store.save_registry(id, &registry)?;
        Ok(())
    }

    /// Resolve the name to build entity names from, storing a changed title.
    fn detect_rename(&mut self, collection_id: &str, fetched: Option<&str>) -> Result<String> {
        let stored = self.store.remote_collection_name(collection_id)?;
        let fetched = fetched.map(str::trim).filter(|t| !t.is_empty());

        match (fetched, stored) {
            (Some(current), stored) => {
                if stored.as_deref() != Some(current) {
                    tracing::info!(
                        collection = collection_id,
                        from = stored.as_deref().unwrap_or("-"),
                        to = current,
                        "Remote collection renamed"
                    );
                    self.store.set_remote_collection_name(collection_id, current)?;
                }
                Ok(current.to_string())
            }
            (None, Some(stored)) => Ok(stored),
            (None, None) => Ok(collection_id.to_string()),
        }
    }

    fn journal(&mut self, run_id: &str, report: &SyncReport, started_at: i64) {
        if self.dry_run {
            return;
        }
        let record = SyncRunRecord {
            run_id: run_id.to_string(),
            collection_id: report.collection_id.clone(),
            status: report.status.as_str().to_string(),
            created: report.created,
            updated: report.updated,
            deleted: report.deleted,
            ignored: report.ignored,
            errors: report.errors.clone(),
            started_at,
            finished_at: chrono::Utc::now().timestamp_millis(),
        };
        if let Err(err) = self.store.record_sync_run(&record) {
            tracing::warn!(collection = %report.collection_id, error = %err, "Failed to journal sync run");
        }
    }
}

fn storage_failed(mut report: SyncReport, err: &Error) -> SyncReport {
    let err = SyncError::Storage(err.to_string());
    tracing::error!(collection = %report.collection_id, error = %err, "Collection rolled back");
    report.status = RunStatus::StorageFailed;
    report.errors.push(err.to_string());
    report
}

fn abort_before_writes(
    mut batch: BatchReport,
    collection_ids: &[String],
    failed: &str,
    err: &SyncError,
) -> BatchReport {
    batch.outcome = BatchOutcome::Aborted;
    batch.error = Some(err.to_string());
    batch.reports = collection_ids
        .iter()
        .map(|id| {
            if id == failed {
                SyncReport::with_status(id, RunStatus::StorageFailed, Some(err.to_string()))
            } else {
                SyncReport::with_status(id, RunStatus::Skipped, None)
            }
        })
        .collect();
    batch
}

/// Generate a run id: `run_` plus 12 hex characters.
fn generate_run_id() -> String {
    let uuid = uuid::Uuid::new_v4();
    let hex = uuid.simple().to_string();
    format!("run_{}", &hex[..12])
}
