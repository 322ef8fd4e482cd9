//! Student selection commands.
//!
//! Disabling a student only changes the selection. Their notes stay until
//! the next sync asks for confirmation and purges them.

use super::collection::join_or_dash;
use super::open_storage;
use crate::cli::StudentCommands;
use crate::error::{Error, Result};
use crate::storage::{ConfigStore, SqliteStorage};
use crate::validate::parse_toggle;
use colored::Colorize;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;

#[derive(Serialize)]
struct StudentListOutput {
    collection: String,
    enabled: BTreeSet<String>,
    available: BTreeSet<String>,
    synced: BTreeSet<String>,
    /// Synced before but no longer enabled; purged on the next confirmed sync.
    pending_purge: Vec<String>,
    include_missing: bool,
}

/// Execute a student command.
///
/// # Errors
///
/// Returns an error if the collection does not exist or the store fails.
pub fn execute(
    command: &StudentCommands,
    db_path: Option<&PathBuf>,
    actor: Option<&str>,
    json: bool,
) -> Result<()> {
    let mut storage = open_storage(db_path, actor)?;

    match command {
        StudentCommands::List { collection } => execute_list(&storage, collection, json),
        StudentCommands::Enable { collection, names } => {
            let enabled = storage.update_student_selection(collection, &clean(names), &[])?;
            print_selection(collection, &enabled, json)
        }
        StudentCommands::Disable { collection, names } => {
            let enabled = storage.update_student_selection(collection, &[], &clean(names))?;
            print_selection(collection, &enabled, json)
        }
        StudentCommands::Missing { collection, value } => {
            let include = parse_toggle(value)?;
            require_collection(&storage, collection)?;
            storage.set_missing_student_policy(collection, include)?;
            if json {
                let output = serde_json::json!({
                    "collection": collection,
                    "include_missing": include,
                });
                println!("{output}");
            } else {
                let state = if include { "on".green() } else { "off".yellow() };
                println!("Rows without students for {}: {state}", collection.bold());
            }
            Ok(())
        }
    }
}

fn clean(names: &[String]) -> Vec<String> {
    names
        .iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect()
}

fn require_collection(storage: &SqliteStorage, id: &str) -> Result<()> {
    match storage.get_collection(id)? {
        Some(_) => Ok(()),
        None => Err(Error::CollectionNotFound { id: id.to_string() }),
    }
}

fn execute_list(storage: &SqliteStorage, collection: &str, json: bool) -> Result<()> {
    require_collection(storage, collection)?;
    let registry = storage.load_registry(collection)?;
    let output = StudentListOutput {
        collection: collection.to_string(),
        pending_purge: crate::sync::detect_removed_partitions(
            &registry.enabled,
            &registry.sync_history,
        ),
        include_missing: storage.missing_student_policy(collection)?,
        enabled: registry.enabled,
        available: registry.available,
        synced: registry.sync_history,
    };

    if json {
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    println!("Students of {}:", collection.bold());
    if output.available.is_empty() && output.enabled.is_empty() {
        println!("  {}", "None discovered yet; run a sync first.".dimmed());
    }
    for name in output.available.union(&output.enabled) {
        let marker = if output.enabled.contains(name) {
            "[x]".green()
        } else {
            "[ ]".normal()
        };
        let note = if output.pending_purge.contains(name) {
            " (pending purge)".yellow().to_string()
        } else if output.synced.contains(name) {
            " (synced)".dimmed().to_string()
        } else {
            String::new()
        };
        println!("  {marker} {name}{note}");
    }
    println!(
        "  No Student: {}",
        if output.include_missing { "on" } else { "off" }
    );
    Ok(())
}

fn print_selection(collection: &str, enabled: &BTreeSet<String>, json: bool) -> Result<()> {
    if json {
        let output = serde_json::json!({
            "collection": collection,
            "enabled": enabled,
        });
        println!("{output}");
    } else {
        println!("Enabled for {}: {}", collection.bold(), join_or_dash(enabled));
    }
    Ok(())
}
