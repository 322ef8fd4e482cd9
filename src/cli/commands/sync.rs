//! Sync command implementations.
//!
//! `sync run` drives the sync engine over the bundled JSON file source and
//! asks on stdin before purging anything. `sync status` reports what is
//! stored per partition together with the recent run journal.

use super::collection::join_or_dash;
use super::{format_timestamp, open_storage};
use crate::cli::SyncCommands;
use crate::error::{Error, Result};
use crate::model::PartitionKey;
use crate::source::JsonFileSource;
use crate::storage::{ConfigStore, RunJournal, SqliteStorage, SyncRunRecord};
use crate::sync::{
    AssumeYes, BatchOutcome, BatchReport, ConfirmPurge, PurgePlan, RunStatus, SyncEngine,
    SyncError, SyncReport,
};
use colored::Colorize;
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

/// Execute sync commands.
///
/// # Errors
///
/// Returns an error if the store cannot be opened, the purge is declined, or
/// the batch is aborted or cancelled.
pub fn execute(
    command: &SyncCommands,
    db_path: Option<&PathBuf>,
    actor: Option<&str>,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let mut storage = open_storage(db_path, actor)?;

    match command {
        SyncCommands::Run { collections, yes } => {
            run(&mut storage, collections, *yes, dry_run, json)
        }
        SyncCommands::Status { collection, runs } => {
            status(&storage, collection.as_deref(), *runs, json)
        }
    }
}

fn run(
    storage: &mut SqliteStorage,
    collections: &[String],
    yes: bool,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let ids: Vec<String> = if collections.is_empty() {
        storage.list_collections()?.into_iter().map(|c| c.id).collect()
    } else {
        collections.to_vec()
    };

    if ids.is_empty() {
        if json {
            println!("{}", serde_json::to_string(&BatchReport::new(""))?);
        } else {
            println!("No collections registered.");
        }
        return Ok(());
    }

    let mut assume_yes = AssumeYes;
    let mut prompt = StdinPrompt;
    let confirm: &mut dyn ConfirmPurge = if yes { &mut assume_yes } else { &mut prompt };

    let batch = SyncEngine::new(storage, JsonFileSource::new())
        .dry_run(dry_run)
        .run_batch(&ids, confirm);

    if json {
        println!("{}", serde_json::to_string(&batch)?);
    } else {
        print_batch(&batch);
    }

    batch_result(&batch)
}

/// Map a finished batch onto the command's exit status.
fn batch_result(batch: &BatchReport) -> Result<()> {
    let with_status = |status: RunStatus| -> Vec<String> {
        batch
            .reports
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.collection_id.clone())
            .collect()
    };

    match batch.outcome {
        BatchOutcome::Completed => Ok(()),
        BatchOutcome::Declined => Err(Error::Sync(SyncError::ConfirmationDeclined {
            collections: with_status(RunStatus::Declined),
        })),
        BatchOutcome::Cancelled => Err(Error::Sync(SyncError::Cancelled {
            remaining: with_status(RunStatus::Cancelled),
        })),
        BatchOutcome::Aborted => Err(Error::Sync(SyncError::Storage(
            batch
                .error
                .clone()
                .unwrap_or_else(|| "batch aborted".to_string()),
        ))),
    }
}

/// Asks on stderr and reads the answer from stdin. EOF declines.
struct StdinPrompt;

impl ConfirmPurge for StdinPrompt {
    fn confirm(&mut self, plans: &[PurgePlan]) -> bool {
        let mut err = io::stderr().lock();
        let _ = writeln!(
            err,
            "{}",
            "The following students are no longer enabled. Their notes, empty decks and unused note types will be deleted:"
                .yellow()
        );
        for plan in plans {
            let _ = writeln!(err, "  {}: {}", plan.collection_id.bold(), plan.labels().join(", "));
        }
        let _ = write!(err, "Proceed? [y/N] ");
        let _ = err.flush();

        let mut answer = String::new();
        match io::stdin().lock().read_line(&mut answer) {
            Ok(0) | Err(_) => false,
            Ok(_) => matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"),
        }
    }
}

fn print_batch(batch: &BatchReport) {
    for report in &batch.reports {
        print_report(report);
    }
    match batch.outcome {
        BatchOutcome::Completed => {
            let failures = batch.fetch_failures().count();
            if failures > 0 {
                println!(
                    "{}",
                    format!("{failures} collection(s) could not be fetched").yellow()
                );
            }
        }
        BatchOutcome::Declined => println!("{}", "Purge declined; nothing was written.".yellow()),
        BatchOutcome::Cancelled => println!("{}", "Sync cancelled.".yellow()),
        BatchOutcome::Aborted => println!("{}", "Sync aborted; later collections skipped.".red()),
    }
}

fn print_report(report: &SyncReport) {
    let status = match report.status {
        RunStatus::Completed => report.status.as_str().green(),
        RunStatus::DryRun => "dry run (rolled back)".cyan(),
        RunStatus::FetchFailed | RunStatus::StorageFailed | RunStatus::Stale => {
            report.status.as_str().red()
        }
        RunStatus::Declined | RunStatus::Cancelled | RunStatus::Skipped => {
            report.status.as_str().yellow()
        }
    };
    let name = report
        .remote_name
        .as_deref()
        .map(|n| format!(" ({n})"))
        .unwrap_or_default();
    println!("{}{name}: {status}", report.collection_id.bold());

    if matches!(report.status, RunStatus::Completed | RunStatus::DryRun | RunStatus::StorageFailed) {
        println!(
            "  {} created, {} updated, {} deleted, {} ignored",
            report.created, report.updated, report.deleted, report.ignored
        );
    }
    if !report.purged_partitions.is_empty() {
        println!(
            "  Purged {}: {} notes, {} decks, {} note types",
            report.purged_partitions.join(", "),
            report.purged.notes_removed,
            report.purged.decks_removed,
            report.purged.note_types_removed
        );
    }
    if report.names.deck_renamed || !report.names.note_types_renamed.is_empty() {
        println!(
            "  Renamed deck: {}, note types renamed: {}",
            if report.names.deck_renamed { "yes" } else { "no" },
            report.names.note_types_renamed.len()
        );
    }
    if !report.discovered.is_empty() {
        println!(
            "  New students: {} {}",
            report.discovered.join(", "),
            "(enable with 'decksync student enable')".dimmed()
        );
    }
    for warning in &report.warnings {
        println!("  {} {warning}", "warning:".yellow());
    }
    for error in &report.errors {
        println!("  {} {error}", "error:".red());
    }
}

#[derive(Serialize)]
struct PartitionCount {
    partition: String,
    notes: usize,
}

#[derive(Serialize)]
struct CollectionStatus {
    id: String,
    remote_name: Option<String>,
    partitions: Vec<PartitionCount>,
    enabled: BTreeSet<String>,
    synced: BTreeSet<String>,
    pending_purge: Vec<String>,
    include_missing: bool,
    recent_runs: Vec<SyncRunRecord>,
}

fn status(storage: &SqliteStorage, collection: Option<&str>, runs: usize, json: bool) -> Result<()> {
    let ids: Vec<String> = match collection {
        Some(id) => {
            if storage.get_collection(id)?.is_none() {
                return Err(Error::CollectionNotFound { id: id.to_string() });
            }
            vec![id.to_string()]
        }
        None => storage.list_collections()?.into_iter().map(|c| c.id).collect(),
    };

    let statuses = ids
        .iter()
        .map(|id| collection_status(storage, id, runs))
        .collect::<Result<Vec<_>>>()?;

    if json {
        let output = serde_json::json!({
            "collections": statuses,
            "count": statuses.len(),
        });
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    if statuses.is_empty() {
        println!("No collections registered.");
        return Ok(());
    }

    for s in &statuses {
        let name = s.remote_name.as_deref().unwrap_or("-");
        println!("{} {}", s.id.cyan().bold(), name);
        if s.partitions.is_empty() {
            println!("  {}", "No notes".dimmed());
        }
        for p in &s.partitions {
            println!("  {:<20} {:>6} notes", p.partition, p.notes);
        }
        println!("  Enabled: {}", join_or_dash(&s.enabled));
        if !s.pending_purge.is_empty() {
            println!(
                "  {} {}",
                "Pending purge:".yellow(),
                s.pending_purge.join(", ")
            );
        }
        println!(
            "  No Student: {}",
            if s.include_missing { "on" } else { "off" }
        );
        for run in &s.recent_runs {
            println!(
                "  {} {} {} +{} ~{} -{}",
                format_timestamp(run.finished_at).dimmed(),
                run.run_id.dimmed(),
                run.status,
                run.created,
                run.updated,
                run.deleted
            );
        }
    }
    Ok(())
}

fn collection_status(storage: &SqliteStorage, id: &str, runs: usize) -> Result<CollectionStatus> {
    let registry = storage.load_registry(id)?;
    let include_missing = storage.missing_student_policy(id)?;

    let mut pending_purge = crate::sync::detect_removed_partitions(&registry.enabled, &registry.sync_history);
    if !include_missing && registry.missing_synced {
        pending_purge.push(PartitionKey::Missing.label().to_string());
    }

    Ok(CollectionStatus {
        id: id.to_string(),
        remote_name: storage.remote_collection_name(id)?,
        partitions: storage
            .notes_per_partition(id)?
            .into_iter()
            .map(|(partition, notes)| PartitionCount {
                partition: partition.label().to_string(),
                notes,
            })
            .collect(),
        enabled: registry.enabled,
        synced: registry.sync_history,
        pending_purge,
        include_missing,
        recent_runs: storage.recent_sync_runs(id, runs)?,
    })
}
