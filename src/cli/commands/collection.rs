//! Collection management commands.
//!
//! - `decksync collection add <id> <source>` - Register a collection
//! - `decksync collection list` - List registered collections
//! - `decksync collection show <id>` - Show one collection
//! - `decksync collection set-source <id> <source>` - Change its source
//! - `decksync collection remove <id>` - Unregister an empty collection

use super::{format_timestamp, open_storage};
use crate::cli::CollectionCommands;
use crate::error::{Error, Result};
use crate::model::Collection;
use crate::storage::{ConfigStore, SqliteStorage};
use crate::validate::validate_collection_id;
use colored::Colorize;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;

#[derive(Serialize)]
struct CollectionOutput {
    id: String,
    source: String,
    remote_name: Option<String>,
    deck_id: Option<i64>,
    note_count: usize,
    created_at: String,
    updated_at: String,
}

#[derive(Serialize)]
struct CollectionListOutput {
    collections: Vec<CollectionOutput>,
    count: usize,
}

#[derive(Serialize)]
struct CollectionDetail {
    #[serde(flatten)]
    collection: CollectionOutput,
    enabled_students: BTreeSet<String>,
    available_students: BTreeSet<String>,
    synced_students: BTreeSet<String>,
    include_missing: bool,
}

fn describe(storage: &SqliteStorage, collection: Collection) -> Result<CollectionOutput> {
    Ok(CollectionOutput {
        remote_name: storage.remote_collection_name(&collection.id)?,
        deck_id: storage.collection_deck_id(&collection.id)?,
        note_count: storage.count_notes(&collection.id)?,
        created_at: format_timestamp(collection.created_at),
        updated_at: format_timestamp(collection.updated_at),
        id: collection.id,
        source: collection.source,
    })
}

/// Execute a collection command.
///
/// # Errors
///
/// Returns an error if the store is not initialized or the operation fails.
pub fn execute(
    command: &CollectionCommands,
    db_path: Option<&PathBuf>,
    actor: Option<&str>,
    json: bool,
) -> Result<()> {
    let mut storage = open_storage(db_path, actor)?;

    match command {
        CollectionCommands::Add {
            id,
            source,
            students,
        } => execute_add(&mut storage, id, source, students, json),
        CollectionCommands::List => execute_list(&storage, json),
        CollectionCommands::Show { id } => execute_show(&storage, id, json),
        CollectionCommands::SetSource { id, source } => {
            storage.update_collection_source(id, source)?;
            if json {
                let output = serde_json::json!({ "id": id, "source": source });
                println!("{output}");
            } else {
                println!("Updated source of {} to {source}", id.bold());
            }
            Ok(())
        }
        CollectionCommands::Remove { id } => {
            storage.delete_collection(id)?;
            if json {
                let output = serde_json::json!({ "id": id, "removed": true });
                println!("{output}");
            } else {
                println!("Removed collection {}", id.bold());
            }
            Ok(())
        }
    }
}

fn execute_add(
    storage: &mut SqliteStorage,
    id: &str,
    source: &str,
    students: &[String],
    json: bool,
) -> Result<()> {
    validate_collection_id(id)?;
    if source.trim().is_empty() {
        return Err(Error::InvalidArgument("source cannot be empty".into()));
    }

    let collection = Collection::new(id, source);
    storage.create_collection(&collection)?;

    let students: Vec<String> = students
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let enabled = if students.is_empty() {
        BTreeSet::new()
    } else {
        storage.update_student_selection(id, &students, &[])?
    };

    if json {
        let output = serde_json::json!({
            "id": collection.id,
            "source": collection.source,
            "enabled_students": enabled,
        });
        println!("{}", serde_json::to_string(&output)?);
    } else {
        println!("Registered collection {}", collection.id.bold());
        println!("  Source: {}", collection.source);
        if enabled.is_empty() {
            println!(
                "  {}",
                "No students enabled yet; run a sync to discover them.".dimmed()
            );
        } else {
            let names: Vec<&str> = enabled.iter().map(String::as_str).collect();
            println!("  Students: {}", names.join(", "));
        }
    }
    Ok(())
}

fn execute_list(storage: &SqliteStorage, json: bool) -> Result<()> {
    let collections = storage
        .list_collections()?
        .into_iter()
        .map(|c| describe(storage, c))
        .collect::<Result<Vec<_>>>()?;

    if json {
        let output = CollectionListOutput {
            count: collections.len(),
            collections,
        };
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    if collections.is_empty() {
        println!("No collections registered.");
        return Ok(());
    }

    println!("Collections ({}):", collections.len());
    for c in &collections {
        let name = c.remote_name.as_deref().unwrap_or("-");
        println!(
            "  {} {} {}",
            c.id.bold(),
            name,
            format!("[{} notes]", c.note_count).dimmed()
        );
        println!("    {}", c.source.dimmed());
    }
    Ok(())
}

fn execute_show(storage: &SqliteStorage, id: &str, json: bool) -> Result<()> {
    let collection = storage
        .get_collection(id)?
        .ok_or_else(|| Error::CollectionNotFound { id: id.to_string() })?;
    let registry = storage.load_registry(id)?;
    let detail = CollectionDetail {
        collection: describe(storage, collection)?,
        enabled_students: registry.enabled,
        available_students: registry.available,
        synced_students: registry.sync_history,
        include_missing: storage.missing_student_policy(id)?,
    };

    if json {
        println!("{}", serde_json::to_string(&detail)?);
        return Ok(());
    }

    let c = &detail.collection;
    println!("{}", c.id.cyan().bold());
    println!("  Source:      {}", c.source);
    println!("  Remote name: {}", c.remote_name.as_deref().unwrap_or("-"));
    println!(
        "  Root deck:   {}",
        c.deck_id.map_or_else(|| "-".to_string(), |d| d.to_string())
    );
    println!("  Notes:       {}", c.note_count);
    println!("  Enabled:     {}", join_or_dash(&detail.enabled_students));
    println!("  Available:   {}", join_or_dash(&detail.available_students));
    println!("  Synced:      {}", join_or_dash(&detail.synced_students));
    println!(
        "  No Student:  {}",
        if detail.include_missing { "on" } else { "off" }
    );
    println!("  Updated:     {}", c.updated_at.dimmed());
    Ok(())
}

pub(crate) fn join_or_dash(names: &BTreeSet<String>) -> String {
    if names.is_empty() {
        "-".to_string()
    } else {
        names.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
    }
}
