//! Storage layer for decksync.
//!
//! The reconciliation engine talks to storage only through the traits in this
//! module:
//!
//! - [`LocalStore`] - notes, decks and note types (the local record store)
//! - [`ConfigStore`] - per-collection whole-value key-value configuration
//! - [`WriteLock`] - exclusive write transaction around one collection
//! - [`RunJournal`] - history of finished sync runs
//!
//! [`SqliteStorage`] implements all four on a single SQLite connection, so a
//! collection's notes and its configuration commit or roll back together.
//!
//! # Submodules
//!
//! - [`events`] - Audit event storage
//! - [`schema`] - Database schema definitions
//! - [`sqlite`] - Main SQLite storage implementation

pub mod events;
pub mod schema;
pub mod sqlite;

pub use sqlite::SqliteStorage;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::Result;
use crate::model::{
    Collection, Deck, DeckPath, LocalNote, NoteDraft, NoteType, NoteTypeBinding, PartitionKey,
    StudentRegistry, UpsertOutcome, Variant,
};

pub const KEY_ENABLED_STUDENTS: &str = "enabled_students";
pub const KEY_AVAILABLE_STUDENTS: &str = "available_students";
pub const KEY_SYNC_HISTORY: &str = "sync_history";
pub const KEY_INCLUDE_MISSING: &str = "include_missing";
pub const KEY_MISSING_SYNCED: &str = "missing_synced";
pub const KEY_REMOTE_NAME: &str = "remote_name";
pub const KEY_DECK_ID: &str = "deck_id";

/// Local record store operations used by reconciliation and cleanup.
pub trait LocalStore {
    /// Look up the note for one `(collection, partition, row)` key.
    fn find_note(
        &self,
        collection_id: &str,
        partition: &PartitionKey,
        row_id: &str,
    ) -> Result<Option<LocalNote>>;

    /// All notes owned by a collection, ordered by id.
    fn list_notes(&self, collection_id: &str) -> Result<Vec<LocalNote>>;

    /// Insert or update the note keyed by the draft's composite key.
    fn upsert_note(&mut self, draft: &NoteDraft) -> Result<UpsertOutcome>;

    /// Delete notes by id; returns the number removed.
    fn delete_notes(&mut self, note_ids: &[i64]) -> Result<usize>;

    /// Delete every note of one partition; returns the number removed.
    fn delete_partition_notes(
        &mut self,
        collection_id: &str,
        partition: &PartitionKey,
    ) -> Result<usize>;

    /// Ensure every deck along `path` exists; returns the leaf deck id.
    fn ensure_deck_path(&mut self, path: &DeckPath) -> Result<i64>;

    fn get_deck(&self, deck_id: i64) -> Result<Option<Deck>>;

    fn find_deck_by_name(&self, name: &str) -> Result<Option<Deck>>;

    /// Rename a deck in place. Descendant deck names follow the new prefix;
    /// notes keep their deck ids.
    fn rename_deck(&mut self, deck_id: i64, new_name: &str) -> Result<()>;

    /// The deck named `name` and all of its descendants.
    fn deck_subtree(&self, name: &str) -> Result<Vec<Deck>>;

    /// Whether a deck holds no notes and has no child decks.
    fn deck_is_empty(&self, deck_id: i64) -> Result<bool>;

    fn delete_deck(&mut self, deck_id: i64) -> Result<()>;

    fn get_note_type(&self, id: i64) -> Result<Option<NoteType>>;

    fn find_note_type_by_name(&self, name: &str) -> Result<Option<NoteType>>;

    fn create_note_type(&mut self, name: &str, variant: Variant, fields: &[&str]) -> Result<i64>;

    fn rename_note_type(&mut self, id: i64, new_name: &str) -> Result<()>;

    fn delete_note_type(&mut self, id: i64) -> Result<()>;

    /// Number of notes using a note type.
    fn note_type_usage(&self, id: i64) -> Result<usize>;

    /// Side-table entries for one collection.
    fn note_type_bindings(&self, collection_id: &str) -> Result<Vec<NoteTypeBinding>>;

    /// Insert or replace a side-table entry.
    fn bind_note_type(&mut self, binding: &NoteTypeBinding) -> Result<()>;

    fn unbind_note_type(&mut self, collection_id: &str, note_type_id: i64) -> Result<()>;

    /// Collections with a side-table entry for a note type, ordered by id.
    fn note_type_owners(&self, note_type_id: i64) -> Result<Vec<String>>;
}

/// Per-collection configuration, read and written as whole JSON values.
pub trait ConfigStore {
    fn get_collection(&self, id: &str) -> Result<Option<Collection>>;

    fn list_collections(&self) -> Result<Vec<Collection>>;

    fn config_value(&self, collection_id: &str, key: &str) -> Result<Option<serde_json::Value>>;

    fn set_config_value(
        &mut self,
        collection_id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()>;

    fn enabled_students(&self, collection_id: &str) -> Result<BTreeSet<String>> {
        read_or_default(self, collection_id, KEY_ENABLED_STUDENTS)
    }

    fn set_enabled_students(&mut self, collection_id: &str, students: &BTreeSet<String>) -> Result<()> {
        write_value(self, collection_id, KEY_ENABLED_STUDENTS, students)
    }

    fn available_students(&self, collection_id: &str) -> Result<BTreeSet<String>> {
        read_or_default(self, collection_id, KEY_AVAILABLE_STUDENTS)
    }

    fn set_available_students(
        &mut self,
        collection_id: &str,
        students: &BTreeSet<String>,
    ) -> Result<()> {
        write_value(self, collection_id, KEY_AVAILABLE_STUDENTS, students)
    }

    fn sync_history(&self, collection_id: &str) -> Result<BTreeSet<String>> {
        read_or_default(self, collection_id, KEY_SYNC_HISTORY)
    }

    /// Replace the recorded sync history.
    fn record_sync_history(
        &mut self,
        collection_id: &str,
        partitions: &BTreeSet<String>,
    ) -> Result<()> {
        write_value(self, collection_id, KEY_SYNC_HISTORY, partitions)
    }

    /// Whether rows without students sync into the missing-student partition.
    fn missing_student_policy(&self, collection_id: &str) -> Result<bool> {
        read_or_default(self, collection_id, KEY_INCLUDE_MISSING)
    }

    fn set_missing_student_policy(&mut self, collection_id: &str, include: bool) -> Result<()> {
        write_value(self, collection_id, KEY_INCLUDE_MISSING, &include)
    }

    fn remote_collection_name(&self, collection_id: &str) -> Result<Option<String>> {
        read_or_default(self, collection_id, KEY_REMOTE_NAME)
    }

    fn set_remote_collection_name(&mut self, collection_id: &str, name: &str) -> Result<()> {
        write_value(self, collection_id, KEY_REMOTE_NAME, &name)
    }

    /// Id of the collection's root deck, once one has been created.
    fn collection_deck_id(&self, collection_id: &str) -> Result<Option<i64>> {
        read_or_default(self, collection_id, KEY_DECK_ID)
    }

    fn set_collection_deck_id(&mut self, collection_id: &str, deck_id: Option<i64>) -> Result<()> {
        write_value(self, collection_id, KEY_DECK_ID, &deck_id)
    }

    /// Another collection that records `deck_id` as its root deck.
    fn deck_root_owner(&self, deck_id: i64, except: &str) -> Result<Option<String>> {
        for collection in self.list_collections()? {
            if collection.id != except && self.collection_deck_id(&collection.id)? == Some(deck_id) {
                return Ok(Some(collection.id));
            }
        }
        Ok(None)
    }

    fn load_registry(&self, collection_id: &str) -> Result<StudentRegistry> {
        Ok(StudentRegistry {
            available: self.available_students(collection_id)?,
            enabled: self.enabled_students(collection_id)?,
            sync_history: self.sync_history(collection_id)?,
            missing_synced: read_or_default(self, collection_id, KEY_MISSING_SYNCED)?,
        })
    }

    fn save_registry(&mut self, collection_id: &str, registry: &StudentRegistry) -> Result<()> {
        self.set_available_students(collection_id, &registry.available)?;
        self.set_enabled_students(collection_id, &registry.enabled)?;
        self.record_sync_history(collection_id, &registry.sync_history)?;
        write_value(self, collection_id, KEY_MISSING_SYNCED, &registry.missing_synced)
    }
}

fn read_or_default<S, T>(store: &S, collection_id: &str, key: &str) -> Result<T>
where
    S: ConfigStore + ?Sized,
    T: DeserializeOwned + Default,
{
    match store.config_value(collection_id, key)? {
        Some(value) => Ok(serde_json::from_value(value)?),
        None => Ok(T::default()),
    }
}

fn write_value<S, T>(store: &mut S, collection_id: &str, key: &str, value: &T) -> Result<()>
where
    S: ConfigStore + ?Sized,
    T: Serialize + ?Sized,
{
    store.set_config_value(collection_id, key, serde_json::to_value(value)?)
}

/// Exclusive write transaction held for a whole collection reconciliation.
pub trait WriteLock {
    /// Take the store's write lock. Fails if one is already held.
    fn begin_write(&mut self) -> Result<()>;

    fn commit_write(&mut self) -> Result<()>;

    fn rollback_write(&mut self) -> Result<()>;
}

/// One journaled sync run for one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRunRecord {
    pub run_id: String,
    pub collection_id: String,
    pub status: String,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub ignored: usize,
    pub errors: Vec<String>,
    pub started_at: i64,
    pub finished_at: i64,
}

/// History of finished runs, written outside the collection transaction so
/// failed runs are journaled too.
pub trait RunJournal {
    fn record_sync_run(&mut self, record: &SyncRunRecord) -> Result<()>;

    /// Most recent runs for a collection, newest first.
    fn recent_sync_runs(&self, collection_id: &str, limit: usize) -> Result<Vec<SyncRunRecord>>;
}
