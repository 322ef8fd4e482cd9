//! SQLite storage implementation.
//!
//! This module provides the storage backend for decksync using SQLite.
//!
//! Two transaction disciplines coexist on the one connection:
//!
//! - CLI-level writes (registering a collection, toggling students) go
//!   through [`SqliteStorage::mutate`], which wraps the closure in its own
//!   IMMEDIATE transaction and writes the audit events at the end.
//! - Sync writes happen under [`WriteLock`]. The engine opens one IMMEDIATE
//!   transaction per collection and every trait method below writes straight
//!   to the connection inside it, so a collection's notes, decks, note types
//!   and configuration commit or roll back together. Methods that issue more
//!   than one statement take a savepoint so a failure leaves no half-applied
//!   change behind.

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Transaction};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::{
    Collection, Deck, DeckPath, LocalNote, NoteDraft, NoteType, NoteTypeBinding, PartitionKey,
    UpsertOutcome, Variant,
};
use crate::storage::events::{insert_event, Event, EventType};
use crate::storage::schema::apply_schema;
use crate::storage::{ConfigStore, LocalStore, RunJournal, SyncRunRecord, WriteLock};
use crate::sync::hash::note_guid;

/// Actor recorded on audit events when none is configured.
pub const DEFAULT_ACTOR: &str = "decksync";

/// SQLite-based storage backend.
#[derive(Debug)]
pub struct SqliteStorage {
    conn: Connection,
    actor: String,
}

/// Context for a mutation operation, tracking side effects.
///
/// Passed to [`SqliteStorage::mutate`] closures to collect audit events that
/// are written just before the transaction commits.
pub struct MutationContext {
    /// Name of the operation being performed.
    pub op_name: String,
    /// Actor performing the operation.
    pub actor: String,
    /// Events to write at the end of the transaction.
    pub events: Vec<Event>,
}

impl MutationContext {
    /// Create a new mutation context.
    #[must_use]
    pub fn new(op_name: &str, actor: &str) -> Self {
        Self {
            op_name: op_name.to_string(),
            actor: actor.to_string(),
            events: Vec::new(),
        }
    }

    /// Record an event for this operation.
    pub fn record_event(&mut self, entity_type: &str, entity_id: &str, event_type: EventType) {
        self.events.push(
            Event::new(entity_type, entity_id, event_type, &self.actor).with_comment(&self.op_name),
        );
    }

    /// Record an event with old/new values for field tracking.
    pub fn record_change(
        &mut self,
        entity_type: &str,
        entity_id: &str,
        event_type: EventType,
        old_value: Option<String>,
        new_value: Option<String>,
    ) {
        self.events.push(
            Event::new(entity_type, entity_id, event_type, &self.actor)
                .with_values(old_value, new_value)
                .with_comment(&self.op_name),
        );
    }
}

impl SqliteStorage {
    /// Open a database at the given path.
    ///
    /// Creates the database and applies schema if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or schema fails.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, None)
    }

    /// Open a database with an optional busy timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or schema fails.
    pub fn open_with_timeout(path: &Path, timeout_ms: Option<u64>) -> Result<Self> {
        let conn = Connection::open(path)?;

        if let Some(timeout) = timeout_ms {
            conn.busy_timeout(Duration::from_millis(timeout))?;
        } else {
            // Default 5 second timeout
            conn.busy_timeout(Duration::from_secs(5))?;
        }

        apply_schema(&conn)?;
        Ok(Self {
            conn,
            actor: DEFAULT_ACTOR.to_string(),
        })
    }

    /// Open an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self {
            conn,
            actor: DEFAULT_ACTOR.to_string(),
        })
    }

    /// Set the actor recorded on audit events.
    #[must_use]
    pub fn with_actor(mut self, actor: &str) -> Self {
        self.actor = actor.to_string();
        self
    }

    #[must_use]
    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Get a reference to the underlying connection (for read operations).
    #[must_use]
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Whether a write lock transaction is currently open.
    #[must_use]
    pub fn in_write(&self) -> bool {
        !self.conn.is_autocommit()
    }

    /// Execute a mutation with the transaction protocol.
    ///
    /// This method:
    /// 1. Begins an IMMEDIATE transaction (for write locking)
    /// 2. Executes the mutation closure
    /// 3. Writes audit events
    /// 4. Commits (or rolls back on error)
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails. The transaction is rolled back on error.
    pub fn mutate<F, R>(&mut self, op: &str, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction, &mut MutationContext) -> Result<R>,
    {
        let mut ctx = MutationContext::new(op, &self.actor);

        let tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let result = f(&tx, &mut ctx)?;

        for event in &ctx.events {
            insert_event(&tx, event)?;
        }

        tx.commit()?;

        Ok(result)
    }

    /// Write one audit event on the current connection.
    fn record(
        &self,
        entity_type: &str,
        entity_id: &str,
        event_type: EventType,
        old_value: Option<String>,
        new_value: Option<String>,
    ) -> Result<()> {
        let event = Event::new(entity_type, entity_id, event_type, &self.actor)
            .with_values(old_value, new_value);
        insert_event(&self.conn, &event)?;
        Ok(())
    }

    // ====================
    // Collection Operations
    // ====================

    /// Register a new collection.
    ///
    /// # Errors
    ///
    /// Returns `CollectionExists` if the id is taken.
    pub fn create_collection(&mut self, collection: &Collection) -> Result<()> {
        if self.get_collection(&collection.id)?.is_some() {
            return Err(Error::CollectionExists {
                id: collection.id.clone(),
            });
        }

        self.mutate("create_collection", |tx, ctx| {
            tx.execute(
                "INSERT INTO collections (id, source, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    collection.id,
                    collection.source,
                    collection.created_at,
                    collection.updated_at
                ],
            )?;
            ctx.record_change(
                "collection",
                &collection.id,
                EventType::CollectionAdded,
                None,
                Some(collection.source.clone()),
            );
            Ok(())
        })
    }

    /// Point a collection at a different source locator.
    ///
    /// # Errors
    ///
    /// Returns `CollectionNotFound` if the collection does not exist.
    pub fn update_collection_source(&mut self, id: &str, source: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        self.mutate("update_collection_source", |tx, ctx| {
            let old: Option<String> = tx
                .query_row("SELECT source FROM collections WHERE id = ?1", [id], |row| {
                    row.get(0)
                })
                .optional()?;
            let Some(old) = old else {
                return Err(Error::CollectionNotFound { id: id.to_string() });
            };
            tx.execute(
                "UPDATE collections SET source = ?2, updated_at = ?3 WHERE id = ?1",
                rusqlite::params![id, source, now],
            )?;
            ctx.record_change(
                "collection",
                id,
                EventType::ConfigChanged,
                Some(old),
                Some(source.to_string()),
            );
            Ok(())
        })
    }

    /// Remove a collection and its configuration.
    ///
    /// Refuses while the collection still owns notes; purge them with a sync
    /// first.
    ///
    /// # Errors
    ///
    /// Returns `CollectionNotFound` or `CollectionNotEmpty`.
    pub fn delete_collection(&mut self, id: &str) -> Result<()> {
        if self.get_collection(id)?.is_none() {
            return Err(Error::CollectionNotFound { id: id.to_string() });
        }
        let notes = self.count_notes(id)?;
        if notes > 0 {
            return Err(Error::CollectionNotEmpty {
                id: id.to_string(),
                notes,
            });
        }

        self.mutate("delete_collection", |tx, ctx| {
            tx.execute(
                "DELETE FROM note_type_bindings WHERE collection_id = ?1",
                [id],
            )?;
            tx.execute("DELETE FROM collection_config WHERE collection_id = ?1", [id])?;
            tx.execute("DELETE FROM collections WHERE id = ?1", [id])?;
            ctx.record_event("collection", id, EventType::CollectionRemoved);
            Ok(())
        })
    }

    /// Number of notes owned by a collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn count_notes(&self, collection_id: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM notes WHERE collection_id = ?1",
            [collection_id],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Note counts per partition, ordered by partition key.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn notes_per_partition(&self, collection_id: &str) -> Result<Vec<(PartitionKey, usize)>> {
        let mut stmt = self.conn.prepare(
            "SELECT partition_key, COUNT(*) FROM notes
             WHERE collection_id = ?1
             GROUP BY partition_key
             ORDER BY partition_key",
        )?;
        let rows = stmt.query_map([collection_id], |row| {
            let key: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((
                PartitionKey::from_storage_key(&key),
                usize::try_from(count).unwrap_or_default(),
            ))
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    /// Toggle students and the missing-student policy in one transaction.
    ///
    /// `enable` and `disable` are applied in that order. Enabled students are
    /// also marked available.
    ///
    /// # Errors
    ///
    /// Returns `CollectionNotFound` if the collection does not exist.
    pub fn update_student_selection(
        &mut self,
        collection_id: &str,
        enable: &[String],
        disable: &[String],
    ) -> Result<BTreeSet<String>> {
        if self.get_collection(collection_id)?.is_none() {
            return Err(Error::CollectionNotFound {
                id: collection_id.to_string(),
            });
        }

        // The registry is read under the lock
        self.begin_write()?;
        let result = self.load_registry(collection_id).and_then(|mut registry| {
            registry.enable(enable.iter().map(String::as_str));
            registry.disable(disable.iter().map(String::as_str));
            self.set_available_students(collection_id, &registry.available)?;
            self.set_enabled_students(collection_id, &registry.enabled)?;
            Ok(registry.enabled)
        });
        match result {
            Ok(enabled) => {
                self.commit_write()?;
                Ok(enabled)
            }
            Err(err) => {
                self.rollback_write()?;
                Err(err)
            }
        }
    }

    /// Every deck in the store, ordered by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_decks(&self) -> Result<Vec<Deck>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name FROM decks ORDER BY name")?;
        let rows = stmt.query_map([], map_deck_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    /// Every note type in the store, ordered by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_note_types(&self) -> Result<Vec<NoteType>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, variant, fields FROM note_types ORDER BY name")?;
        let rows = stmt.query_map([], map_note_type_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn note_id_for_key(
        &self,
        collection_id: &str,
        partition: &PartitionKey,
        row_id: &str,
    ) -> Result<Option<i64>> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM notes
                 WHERE collection_id = ?1 AND partition_key = ?2 AND row_id = ?3",
                rusqlite::params![collection_id, partition.storage_key(), row_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }
}

const NOTE_COLUMNS: &str = "n.id, n.guid, n.collection_id, n.row_id, n.partition_key, n.fields, n.tags,
     n.deck_id, d.name, n.note_type_id, n.created_at, n.updated_at";

impl LocalStore for SqliteStorage {
    fn find_note(
        &self,
        collection_id: &str,
        partition: &PartitionKey,
        row_id: &str,
    ) -> Result<Option<LocalNote>> {
        let sql = format!(
            "SELECT {NOTE_COLUMNS}
             FROM notes n JOIN decks d ON d.id = n.deck_id
             WHERE n.collection_id = ?1 AND n.partition_key = ?2 AND n.row_id = ?3"
        );
        let note = self
            .conn
            .query_row(
                &sql,
                rusqlite::params![collection_id, partition.storage_key(), row_id],
                map_note_row,
            )
            .optional()?;
        Ok(note)
    }

    fn list_notes(&self, collection_id: &str) -> Result<Vec<LocalNote>> {
        let sql = format!(
            "SELECT {NOTE_COLUMNS}
             FROM notes n JOIN decks d ON d.id = n.deck_id
             WHERE n.collection_id = ?1
             ORDER BY n.id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([collection_id], map_note_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn upsert_note(&mut self, draft: &NoteDraft) -> Result<UpsertOutcome> {
        let now = chrono::Utc::now().timestamp_millis();
        let fields = serde_json::to_string(&draft.fields)?;
        let tags = serde_json::to_string(&draft.tags)?;

        match self.note_id_for_key(&draft.collection_id, &draft.partition, &draft.row_id)? {
            Some(note_id) => {
                self.conn.execute(
                    "UPDATE notes
                     SET fields = ?2, tags = ?3, deck_id = ?4, note_type_id = ?5, updated_at = ?6
                     WHERE id = ?1",
                    rusqlite::params![
                        note_id,
                        fields,
                        tags,
                        draft.deck_id,
                        draft.note_type_id,
                        now
                    ],
                )?;
                self.record("note", &note_id.to_string(), EventType::NoteUpdated, None, None)?;
                Ok(UpsertOutcome {
                    note_id,
                    created: false,
                })
            }
            None => {
                let guid = note_guid(&draft.collection_id, &draft.partition, &draft.row_id);
                self.conn.execute(
                    "INSERT INTO notes (guid, collection_id, partition_key, row_id, note_type_id,
                                        deck_id, fields, tags, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                    rusqlite::params![
                        guid,
                        draft.collection_id,
                        draft.partition.storage_key(),
                        draft.row_id,
                        draft.note_type_id,
                        draft.deck_id,
                        fields,
                        tags,
                        now
                    ],
                )?;
                let note_id = self.conn.last_insert_rowid();
                self.record(
                    "note",
                    &note_id.to_string(),
                    EventType::NoteCreated,
                    None,
                    Some(format!("{}/{}", draft.partition.label(), draft.row_id)),
                )?;
                Ok(UpsertOutcome {
                    note_id,
                    created: true,
                })
            }
        }
    }

    fn delete_notes(&mut self, note_ids: &[i64]) -> Result<usize> {
        let sp = self.conn.savepoint()?;
        let mut removed = 0;
        for id in note_ids {
            let changed = sp.execute("DELETE FROM notes WHERE id = ?1", [id])?;
            if changed > 0 {
                removed += changed;
                let event = Event::new("note", &id.to_string(), EventType::NoteDeleted, &self.actor);
                insert_event(&sp, &event)?;
            }
        }
        sp.commit()?;
        Ok(removed)
    }

    fn delete_partition_notes(
        &mut self,
        collection_id: &str,
        partition: &PartitionKey,
    ) -> Result<usize> {
        let ids: Vec<i64> = {
            let mut stmt = self.conn.prepare(
                "SELECT id FROM notes WHERE collection_id = ?1 AND partition_key = ?2 ORDER BY id",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![collection_id, partition.storage_key()],
                |row| row.get(0),
            )?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };
        self.delete_notes(&ids)
    }

    fn ensure_deck_path(&mut self, path: &DeckPath) -> Result<i64> {
        let now = chrono::Utc::now().timestamp_millis();
        let sp = self.conn.savepoint()?;
        let mut leaf = None;
        for name in path.ancestry() {
            let existing: Option<i64> = sp
                .query_row("SELECT id FROM decks WHERE name = ?1", [&name], |row| row.get(0))
                .optional()?;
            let id = match existing {
                Some(id) => id,
                None => {
                    sp.execute(
                        "INSERT INTO decks (name, created_at, updated_at) VALUES (?1, ?2, ?2)",
                        rusqlite::params![name, now],
                    )?;
                    let id = sp.last_insert_rowid();
                    let event = Event::new("deck", &id.to_string(), EventType::DeckCreated, &self.actor)
                        .with_values(None, Some(name.clone()));
                    insert_event(&sp, &event)?;
                    id
                }
            };
            leaf = Some(id);
        }
        sp.commit()?;
        leaf.ok_or_else(|| Error::InvalidArgument("deck path has no segments".to_string()))
    }

    fn get_deck(&self, deck_id: i64) -> Result<Option<Deck>> {
        let deck = self
            .conn
            .query_row("SELECT id, name FROM decks WHERE id = ?1", [deck_id], map_deck_row)
            .optional()?;
        Ok(deck)
    }

    fn find_deck_by_name(&self, name: &str) -> Result<Option<Deck>> {
        let deck = self
            .conn
            .query_row("SELECT id, name FROM decks WHERE name = ?1", [name], map_deck_row)
            .optional()?;
        Ok(deck)
    }

    fn rename_deck(&mut self, deck_id: i64, new_name: &str) -> Result<()> {
        let Some(deck) = self.get_deck(deck_id)? else {
            return Err(Error::Other(format!("deck {deck_id} does not exist")));
        };
        if deck.name == new_name {
            return Ok(());
        }
        if let Some(taken) = self.find_deck_by_name(new_name)? {
            return Err(Error::InvalidArgument(format!(
                "deck name '{new_name}' is already used by deck {}",
                taken.id
            )));
        }

        let now = chrono::Utc::now().timestamp_millis();
        let sp = self.conn.savepoint()?;
        sp.execute(
            "UPDATE decks SET name = ?2, updated_at = ?3 WHERE id = ?1",
            rusqlite::params![deck_id, new_name, now],
        )?;
        // Descendants keep their suffix under the new prefix.
        sp.execute(
            "UPDATE decks
             SET name = ?2 || substr(name, length(?1) + 1), updated_at = ?3
             WHERE substr(name, 1, length(?1) + 2) = ?1 || '::'",
            rusqlite::params![deck.name, new_name, now],
        )?;
        let event = Event::new("deck", &deck_id.to_string(), EventType::DeckRenamed, &self.actor)
            .with_values(Some(deck.name.clone()), Some(new_name.to_string()));
        insert_event(&sp, &event)?;
        sp.commit()?;
        Ok(())
    }

    fn deck_subtree(&self, name: &str) -> Result<Vec<Deck>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name FROM decks
             WHERE name = ?1 OR substr(name, 1, length(?1) + 2) = ?1 || '::'
             ORDER BY name",
        )?;
        let rows = stmt.query_map([name], map_deck_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn deck_is_empty(&self, deck_id: i64) -> Result<bool> {
        let Some(deck) = self.get_deck(deck_id)? else {
            return Ok(true);
        };
        let notes: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM notes WHERE deck_id = ?1",
            [deck_id],
            |row| row.get(0),
        )?;
        let children: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM decks WHERE substr(name, 1, length(?1) + 2) = ?1 || '::'",
            [&deck.name],
            |row| row.get(0),
        )?;
        Ok(notes == 0 && children == 0)
    }

    fn delete_deck(&mut self, deck_id: i64) -> Result<()> {
        let name: Option<String> = self
            .conn
            .query_row("SELECT name FROM decks WHERE id = ?1", [deck_id], |row| row.get(0))
            .optional()?;
        if let Some(name) = name {
            self.conn.execute("DELETE FROM decks WHERE id = ?1", [deck_id])?;
            self.record(
                "deck",
                &deck_id.to_string(),
                EventType::DeckDeleted,
                Some(name),
                None,
            )?;
        }
        Ok(())
    }

    fn get_note_type(&self, id: i64) -> Result<Option<NoteType>> {
        let note_type = self
            .conn
            .query_row(
                "SELECT id, name, variant, fields FROM note_types WHERE id = ?1",
                [id],
                map_note_type_row,
            )
            .optional()?;
        Ok(note_type)
    }

    fn find_note_type_by_name(&self, name: &str) -> Result<Option<NoteType>> {
        let note_type = self
            .conn
            .query_row(
                "SELECT id, name, variant, fields FROM note_types WHERE name = ?1",
                [name],
                map_note_type_row,
            )
            .optional()?;
        Ok(note_type)
    }

    fn create_note_type(&mut self, name: &str, variant: Variant, fields: &[&str]) -> Result<i64> {
        let now = chrono::Utc::now().timestamp_millis();
        let fields = serde_json::to_string(fields)?;
        self.conn.execute(
            "INSERT INTO note_types (name, variant, fields, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            rusqlite::params![name, variant.as_str(), fields, now],
        )?;
        let id = self.conn.last_insert_rowid();
        self.record(
            "note_type",
            &id.to_string(),
            EventType::NoteTypeCreated,
            None,
            Some(name.to_string()),
        )?;
        Ok(id)
    }

    fn rename_note_type(&mut self, id: i64, new_name: &str) -> Result<()> {
        let Some(note_type) = self.get_note_type(id)? else {
            return Err(Error::Other(format!("note type {id} does not exist")));
        };
        if note_type.name == new_name {
            return Ok(());
        }
        if let Some(taken) = self.find_note_type_by_name(new_name)? {
            return Err(Error::InvalidArgument(format!(
                "note type name '{new_name}' is already used by note type {}",
                taken.id
            )));
        }

        let now = chrono::Utc::now().timestamp_millis();
        self.conn.execute(
            "UPDATE note_types SET name = ?2, updated_at = ?3 WHERE id = ?1",
            rusqlite::params![id, new_name, now],
        )?;
        self.record(
            "note_type",
            &id.to_string(),
            EventType::NoteTypeRenamed,
            Some(note_type.name),
            Some(new_name.to_string()),
        )
    }

    fn delete_note_type(&mut self, id: i64) -> Result<()> {
        let Some(note_type) = self.get_note_type(id)? else {
            return Ok(());
        };
        let sp = self.conn.savepoint()?;
        sp.execute("DELETE FROM note_type_bindings WHERE note_type_id = ?1", [id])?;
        sp.execute("DELETE FROM note_types WHERE id = ?1", [id])?;
        let event = Event::new("note_type", &id.to_string(), EventType::NoteTypeDeleted, &self.actor)
            .with_values(Some(note_type.name), None);
        insert_event(&sp, &event)?;
        sp.commit()?;
        Ok(())
    }

    fn note_type_usage(&self, id: i64) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM notes WHERE note_type_id = ?1",
            [id],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn note_type_bindings(&self, collection_id: &str) -> Result<Vec<NoteTypeBinding>> {
        let mut stmt = self.conn.prepare(
            "SELECT collection_id, partition_key, variant, note_type_id
             FROM note_type_bindings
             WHERE collection_id = ?1
             ORDER BY partition_key, variant",
        )?;
        let rows = stmt.query_map([collection_id], |row| {
            let key: String = row.get(1)?;
            let variant: String = row.get(2)?;
            Ok(NoteTypeBinding {
                collection_id: row.get(0)?,
                partition: PartitionKey::from_storage_key(&key),
                variant: parse_variant(2, &variant)?,
                note_type_id: row.get(3)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn bind_note_type(&mut self, binding: &NoteTypeBinding) -> Result<()> {
        self.conn.execute(
            "INSERT INTO note_type_bindings (collection_id, partition_key, variant, note_type_id)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (collection_id, partition_key, variant)
             DO UPDATE SET note_type_id = excluded.note_type_id",
            rusqlite::params![
                binding.collection_id,
                binding.partition.storage_key(),
                binding.variant.as_str(),
                binding.note_type_id
            ],
        )?;
        Ok(())
    }

    fn unbind_note_type(&mut self, collection_id: &str, note_type_id: i64) -> Result<()> {
        self.conn.execute(
            "DELETE FROM note_type_bindings WHERE collection_id = ?1 AND note_type_id = ?2",
            rusqlite::params![collection_id, note_type_id],
        )?;
        Ok(())
    }

    fn note_type_owners(&self, note_type_id: i64) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT collection_id FROM note_type_bindings
             WHERE note_type_id = ?1
             ORDER BY collection_id",
        )?;
        let rows = stmt.query_map([note_type_id], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }
}

impl ConfigStore for SqliteStorage {
    fn get_collection(&self, id: &str) -> Result<Option<Collection>> {
        let collection = self
            .conn
            .query_row(
                "SELECT id, source, created_at, updated_at FROM collections WHERE id = ?1",
                [id],
                map_collection_row,
            )
            .optional()?;
        Ok(collection)
    }

    fn list_collections(&self) -> Result<Vec<Collection>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, source, created_at, updated_at FROM collections ORDER BY id")?;
        let rows = stmt.query_map([], map_collection_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn config_value(&self, collection_id: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM collection_config WHERE collection_id = ?1 AND key = ?2",
                rusqlite::params![collection_id, key],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn set_config_value(
        &mut self,
        collection_id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        let old = self.config_value(collection_id, key)?;
        if old.as_ref() == Some(&value) {
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp_millis();
        let raw = value.to_string();
        self.conn.execute(
            "INSERT INTO collection_config (collection_id, key, value, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (collection_id, key)
             DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            rusqlite::params![collection_id, key, raw, now],
        )?;
        let event = Event::new("collection", collection_id, EventType::ConfigChanged, &self.actor)
            .with_values(old.map(|v| v.to_string()), Some(raw))
            .with_comment(key);
        insert_event(&self.conn, &event)?;
        Ok(())
    }
}

impl WriteLock for SqliteStorage {
    fn begin_write(&mut self) -> Result<()> {
        if self.in_write() {
            return Err(Error::Other("write lock is already held".to_string()));
        }
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit_write(&mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback_write(&mut self) -> Result<()> {
        if self.in_write() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }
}

impl RunJournal for SqliteStorage {
    fn record_sync_run(&mut self, record: &SyncRunRecord) -> Result<()> {
        let errors = serde_json::to_string(&record.errors)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO sync_runs
                 (run_id, collection_id, status, created, updated, deleted, ignored, errors,
                  started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                record.run_id,
                record.collection_id,
                record.status,
                i64::try_from(record.created).unwrap_or(i64::MAX),
                i64::try_from(record.updated).unwrap_or(i64::MAX),
                i64::try_from(record.deleted).unwrap_or(i64::MAX),
                i64::try_from(record.ignored).unwrap_or(i64::MAX),
                errors,
                record.started_at,
                record.finished_at
            ],
        )?;
        Ok(())
    }

    fn recent_sync_runs(&self, collection_id: &str, limit: usize) -> Result<Vec<SyncRunRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, collection_id, status, created, updated, deleted, ignored, errors,
                    started_at, finished_at
             FROM sync_runs
             WHERE collection_id = ?1
             ORDER BY finished_at DESC, run_id DESC
             LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(rusqlite::params![collection_id, limit], |row| {
            let count = |idx: usize| -> rusqlite::Result<usize> {
                let value: i64 = row.get(idx)?;
                Ok(usize::try_from(value).unwrap_or_default())
            };
            let errors: String = row.get(7)?;
            Ok(SyncRunRecord {
                run_id: row.get(0)?,
                collection_id: row.get(1)?,
                status: row.get(2)?,
                created: count(3)?,
                updated: count(4)?,
                deleted: count(5)?,
                ignored: count(6)?,
                errors: serde_json::from_str(&errors).unwrap_or_default(),
                started_at: row.get(8)?,
                finished_at: row.get(9)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }
}

fn parse_variant(idx: usize, raw: &str) -> rusqlite::Result<Variant> {
    raw.parse::<Variant>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

// Helper to map collection rows
fn map_collection_row(row: &rusqlite::Row) -> rusqlite::Result<Collection> {
    Ok(Collection {
        id: row.get(0)?,
        source: row.get(1)?,
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

// Helper to map deck rows
fn map_deck_row(row: &rusqlite::Row) -> rusqlite::Result<Deck> {
    Ok(Deck {
        id: row.get(0)?,
        name: row.get(1)?,
    })
}

// Helper to map note type rows
fn map_note_type_row(row: &rusqlite::Row) -> rusqlite::Result<NoteType> {
    let variant: String = row.get(2)?;
    let fields: String = row.get(3)?;
    Ok(NoteType {
        id: row.get(0)?,
        name: row.get(1)?,
        variant: parse_variant(2, &variant)?,
        fields: serde_json::from_str(&fields).unwrap_or_default(),
    })
}

// Helper to map note rows joined with their deck
fn map_note_row(row: &rusqlite::Row) -> rusqlite::Result<LocalNote> {
    let partition: String = row.get(4)?;
    let fields: String = row.get(5)?;
    let tags: String = row.get(6)?;
    Ok(LocalNote {
        id: row.get(0)?,
        guid: row.get(1)?,
        collection_id: row.get(2)?,
        row_id: row.get(3)?,
        partition: PartitionKey::from_storage_key(&partition),
        fields: serde_json::from_str::<BTreeMap<String, String>>(&fields).unwrap_or_default(),
        tags: serde_json::from_str::<BTreeSet<String>>(&tags).unwrap_or_default(),
        deck_id: row.get(7)?,
        deck_path: row.get(8)?,
        note_type_id: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NOTE_FIELDS;
    use crate::storage::events::get_events;

    fn storage_with_collection(id: &str) -> SqliteStorage {
        let mut storage = SqliteStorage::open_memory().unwrap();
        storage
            .create_collection(&Collection::new(id, "/tmp/source.json"))
            .unwrap();
        storage
    }

    fn draft(storage: &mut SqliteStorage, row_id: &str, question: &str) -> NoteDraft {
        let deck_id = storage
            .ensure_deck_path(&DeckPath::parse("DeckSync::Bio::Amy"))
            .unwrap();
        let note_type_id = match storage.find_note_type_by_name("T").unwrap() {
            Some(nt) => nt.id,
            None => storage.create_note_type("T", Variant::Basic, NOTE_FIELDS).unwrap(),
        };
        let mut fields = BTreeMap::new();
        fields.insert("Question".to_string(), question.to_string());
        NoteDraft {
            collection_id: "bio".into(),
            row_id: row_id.into(),
            partition: PartitionKey::student("Amy"),
            fields,
            tags: BTreeSet::new(),
            deck_id,
            note_type_id,
        }
    }

    #[test]
    fn test_create_and_get_collection() {
        let storage = storage_with_collection("bio");
        let collection = storage.get_collection("bio").unwrap().unwrap();
        assert_eq!(collection.source, "/tmp/source.json");
        assert_eq!(storage.list_collections().unwrap().len(), 1);
    }

    #[test]
    fn test_create_duplicate_collection_fails() {
        let mut storage = storage_with_collection("bio");
        let err = storage
            .create_collection(&Collection::new("bio", "other"))
            .unwrap_err();
        assert!(matches!(err, Error::CollectionExists { .. }));
    }

    #[test]
    fn test_upsert_note_creates_then_updates() {
        let mut storage = storage_with_collection("bio");
        let first = draft(&mut storage, "r1", "Q1");
        let created = storage.upsert_note(&first).unwrap();
        assert!(created.created);

        let mut second = first.clone();
        second.fields.insert("Question".into(), "Q1 edited".into());
        let updated = storage.upsert_note(&second).unwrap();
        assert!(!updated.created);
        assert_eq!(updated.note_id, created.note_id);

        let note = storage
            .find_note("bio", &PartitionKey::student("Amy"), "r1")
            .unwrap()
            .unwrap();
        assert_eq!(note.fields["Question"], "Q1 edited");
        assert_eq!(note.deck_path, "DeckSync::Bio::Amy");
        assert_eq!(storage.count_notes("bio").unwrap(), 1);
    }

    #[test]
    fn test_note_guid_is_stable_per_key() {
        let mut storage = storage_with_collection("bio");
        let d = draft(&mut storage, "r1", "Q");
        storage.upsert_note(&d).unwrap();
        let note = storage.list_notes("bio").unwrap().remove(0);
        assert_eq!(note.guid, note_guid("bio", &PartitionKey::student("Amy"), "r1"));
    }

    #[test]
    fn test_delete_partition_notes() {
        let mut storage = storage_with_collection("bio");
        for row in ["r1", "r2"] {
            let d = draft(&mut storage, row, "Q");
            storage.upsert_note(&d).unwrap();
        }
        let removed = storage
            .delete_partition_notes("bio", &PartitionKey::student("Amy"))
            .unwrap();
        assert_eq!(removed, 2);
        assert!(storage.list_notes("bio").unwrap().is_empty());
    }

    #[test]
    fn test_ensure_deck_path_creates_ancestors_once() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let path = DeckPath::parse("A::B::C");
        let leaf = storage.ensure_deck_path(&path).unwrap();
        let again = storage.ensure_deck_path(&path).unwrap();
        assert_eq!(leaf, again);

        let names: Vec<String> = storage.list_decks().unwrap().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["A", "A::B", "A::B::C"]);
    }

    #[test]
    fn test_rename_deck_moves_descendants() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        storage
            .ensure_deck_path(&DeckPath::parse("DeckSync::Old::Amy::High"))
            .unwrap();
        storage
            .ensure_deck_path(&DeckPath::parse("DeckSync::Older"))
            .unwrap();
        let root = storage.find_deck_by_name("DeckSync::Old").unwrap().unwrap();

        storage.rename_deck(root.id, "DeckSync::New").unwrap();

        assert!(storage.find_deck_by_name("DeckSync::New::Amy::High").unwrap().is_some());
        assert!(storage.find_deck_by_name("DeckSync::Old::Amy").unwrap().is_none());
        // Sibling sharing a textual prefix is untouched
        assert!(storage.find_deck_by_name("DeckSync::Older").unwrap().is_some());

        let events = get_events(storage.conn(), "deck", &root.id.to_string(), None).unwrap();
        assert_eq!(events[0].event_type, EventType::DeckRenamed);
    }

    #[test]
    fn test_rename_deck_conflict_is_rejected() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let a = storage.ensure_deck_path(&DeckPath::parse("A")).unwrap();
        storage.ensure_deck_path(&DeckPath::parse("B")).unwrap();
        assert!(storage.rename_deck(a, "B").is_err());
        assert_eq!(storage.get_deck(a).unwrap().unwrap().name, "A");
    }

    #[test]
    fn test_deck_subtree_and_emptiness() {
        let mut storage = storage_with_collection("bio");
        let d = draft(&mut storage, "r1", "Q");
        storage.upsert_note(&d).unwrap();
        storage.ensure_deck_path(&DeckPath::parse("DeckSync::Bio::Amy::Low")).unwrap();

        let subtree = storage.deck_subtree("DeckSync::Bio::Amy").unwrap();
        assert_eq!(subtree.len(), 2);

        let low = storage.find_deck_by_name("DeckSync::Bio::Amy::Low").unwrap().unwrap();
        assert!(storage.deck_is_empty(low.id).unwrap());
        // Holds a note and a child deck
        assert!(!storage.deck_is_empty(d.deck_id).unwrap());
    }

    #[test]
    fn test_note_type_lifecycle_and_bindings() {
        let mut storage = storage_with_collection("bio");
        let id = storage
            .create_note_type("DeckSync - Bio - Amy - Basic", Variant::Basic, NOTE_FIELDS)
            .unwrap();
        let binding = NoteTypeBinding {
            collection_id: "bio".into(),
            partition: PartitionKey::student("Amy"),
            variant: Variant::Basic,
            note_type_id: id,
        };
        storage.bind_note_type(&binding).unwrap();
        storage.bind_note_type(&binding).unwrap();
        assert_eq!(storage.note_type_bindings("bio").unwrap(), vec![binding]);

        storage.rename_note_type(id, "DeckSync - Biology - Amy - Basic").unwrap();
        let nt = storage.get_note_type(id).unwrap().unwrap();
        assert_eq!(nt.name, "DeckSync - Biology - Amy - Basic");
        assert_eq!(nt.fields.len(), NOTE_FIELDS.len());
        assert_eq!(storage.note_type_usage(id).unwrap(), 0);

        storage.delete_note_type(id).unwrap();
        assert!(storage.get_note_type(id).unwrap().is_none());
        assert!(storage.note_type_bindings("bio").unwrap().is_empty());
    }

    #[test]
    fn test_config_values_roundtrip_and_skip_unchanged() {
        let mut storage = storage_with_collection("bio");
        let students: BTreeSet<String> = ["Amy".to_string(), "Bob".to_string()].into();
        storage.set_enabled_students("bio", &students).unwrap();
        storage.set_enabled_students("bio", &students).unwrap();
        assert_eq!(storage.enabled_students("bio").unwrap(), students);

        let changes = get_events(storage.conn(), "collection", "bio", None)
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == EventType::ConfigChanged)
            .count();
        assert_eq!(changes, 1);

        assert!(!storage.missing_student_policy("bio").unwrap());
        assert_eq!(storage.collection_deck_id("bio").unwrap(), None);
    }

    #[test]
    fn test_write_lock_rollback_discards_everything() {
        let mut storage = storage_with_collection("bio");
        storage.begin_write().unwrap();
        assert!(storage.begin_write().is_err());
        let d = draft(&mut storage, "r1", "Q");
        storage.upsert_note(&d).unwrap();
        storage.set_remote_collection_name("bio", "Biology").unwrap();
        storage.rollback_write().unwrap();

        assert_eq!(storage.count_notes("bio").unwrap(), 0);
        assert!(storage.list_decks().unwrap().is_empty());
        assert_eq!(storage.remote_collection_name("bio").unwrap(), None);
        assert!(!storage.in_write());
    }

    #[test]
    fn test_ownership_lookups() {
        let mut storage = storage_with_collection("bio");
        storage
            .create_collection(&Collection::new("chem", "/tmp/chem.json"))
            .unwrap();
        let nt = storage.create_note_type("T", Variant::Basic, NOTE_FIELDS).unwrap();
        assert!(storage.note_type_owners(nt).unwrap().is_empty());
        for id in ["chem", "bio"] {
            storage
                .bind_note_type(&NoteTypeBinding {
                    collection_id: id.into(),
                    partition: PartitionKey::student("Amy"),
                    variant: Variant::Basic,
                    note_type_id: nt,
                })
                .unwrap();
        }
        assert_eq!(storage.note_type_owners(nt).unwrap(), vec!["bio", "chem"]);

        let root = storage.ensure_deck_path(&DeckPath::parse("DeckSync::Bio")).unwrap();
        storage.set_collection_deck_id("chem", Some(root)).unwrap();
        assert_eq!(storage.deck_root_owner(root, "bio").unwrap().as_deref(), Some("chem"));
        assert_eq!(storage.deck_root_owner(root, "chem").unwrap(), None);
    }

    #[test]
    fn test_student_selection_fails_while_lock_is_held() {
        let mut storage = storage_with_collection("bio");
        storage.begin_write().unwrap();
        assert!(storage
            .update_student_selection("bio", &["Amy".to_string()], &[])
            .is_err());
        storage.rollback_write().unwrap();

        let enabled = storage
            .update_student_selection("bio", &["Amy".to_string()], &[])
            .unwrap();
        assert!(enabled.contains("Amy"));
        assert!(storage.available_students("bio").unwrap().contains("Amy"));
    }

    #[test]
    fn test_write_lock_commit_persists() {
        let mut storage = storage_with_collection("bio");
        storage.begin_write().unwrap();
        storage.set_remote_collection_name("bio", "Biology").unwrap();
        storage.commit_write().unwrap();
        assert_eq!(
            storage.remote_collection_name("bio").unwrap().as_deref(),
            Some("Biology")
        );
    }

    #[test]
    fn test_delete_collection_requires_no_notes() {
        let mut storage = storage_with_collection("bio");
        let d = draft(&mut storage, "r1", "Q");
        storage.upsert_note(&d).unwrap();
        assert!(matches!(
            storage.delete_collection("bio"),
            Err(Error::CollectionNotEmpty { notes: 1, .. })
        ));

        storage
            .delete_partition_notes("bio", &PartitionKey::student("Amy"))
            .unwrap();
        storage.delete_collection("bio").unwrap();
        assert!(storage.get_collection("bio").unwrap().is_none());
    }

    #[test]
    fn test_update_student_selection() {
        let mut storage = storage_with_collection("bio");
        let enabled = storage
            .update_student_selection("bio", &["Amy".into(), "Bob".into()], &["Bob".into()])
            .unwrap();
        assert_eq!(enabled.into_iter().collect::<Vec<_>>(), vec!["Amy".to_string()]);
        assert!(storage.available_students("bio").unwrap().contains("Bob"));
    }

    #[test]
    fn test_sync_run_journal() {
        let mut storage = storage_with_collection("bio");
        for (run, finished) in [("run_a", 10), ("run_b", 20)] {
            storage
                .record_sync_run(&SyncRunRecord {
                    run_id: run.into(),
                    collection_id: "bio".into(),
                    status: "completed".into(),
                    created: 1,
                    updated: 0,
                    deleted: 0,
                    ignored: 2,
                    errors: vec!["row r9 failed".into()],
                    started_at: finished - 5,
                    finished_at: finished,
                })
                .unwrap();
        }
        let runs = storage.recent_sync_runs("bio", 1).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, "run_b");
        assert_eq!(runs[0].errors, vec!["row r9 failed".to_string()]);
    }

    #[test]
    fn test_notes_per_partition() {
        let mut storage = storage_with_collection("bio");
        let d = draft(&mut storage, "r1", "Q");
        storage.upsert_note(&d).unwrap();
        let mut missing = d.clone();
        missing.partition = PartitionKey::Missing;
        storage.upsert_note(&missing).unwrap();

        let counts = storage.notes_per_partition("bio").unwrap();
        assert_eq!(
            counts,
            vec![(PartitionKey::Missing, 1), (PartitionKey::student("Amy"), 1)]
        );
    }
}
