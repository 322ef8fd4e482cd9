//! Reconciliation engine.
//!
//! Makes the local notes of one collection match a set of sync units:
//! unchanged notes are left alone, changed notes are updated in place, new
//! units become notes, and notes whose row has disappeared from the source
//! are deleted. Notes whose row still exists but whose partition produced no
//! unit are never touched here; removing those is the cleanup coordinator's
//! job.

use std::collections::{HashMap, HashSet};

use crate::error::Result;
use crate::model::note::FIELD_QUESTION;
use crate::model::{
    LocalNote, NOTE_FIELDS, NoteDraft, NoteTypeBinding, PartitionKey, SyncUnit, Variant,
    project_fields,
};
use crate::naming;
use crate::storage::LocalStore;
use crate::sync::hash::{content_hash, has_changed};
use crate::sync::types::{PartialFailure, ReconcileStats};
use crate::validate::validate_unit;

type NoteKey = (PartitionKey, String);

/// Reconcile `units` into the notes of `collection_id`.
///
/// `remote_name` must be the collection's current remote name; every deck
/// and note-type name is derived from it.
///
/// # Errors
///
/// Returns [`PartialFailure`] on the first storage error, carrying the
/// counts reached so far. Per-unit validation failures are recorded in
/// [`ReconcileStats::errors`] and do not stop the run.
pub fn reconcile<S: LocalStore + ?Sized>(
    store: &mut S,
    collection_id: &str,
    remote_name: &str,
    units: &[SyncUnit],
    existing_row_ids: &HashSet<String>,
) -> std::result::Result<ReconcileStats, PartialFailure> {
    let mut stats = ReconcileStats::default();
    let mut run = Reconciler {
        store,
        collection_id,
        remote_name,
        index: HashMap::new(),
        bindings: HashMap::new(),
        decks: HashMap::new(),
    };

    match run.execute(units, existing_row_ids, &mut stats) {
        Ok(()) => Ok(stats),
        Err(error) => Err(PartialFailure { stats, error }),
    }
}

struct Reconciler<'a, S: ?Sized> {
    store: &'a mut S,
    collection_id: &'a str,
    remote_name: &'a str,
    index: HashMap<NoteKey, LocalNote>,
    bindings: HashMap<(PartitionKey, Variant), i64>,
    /// Deck ids resolved during this run, by full name.
    decks: HashMap<String, i64>,
}

impl<S: LocalStore + ?Sized> Reconciler<'_, S> {
    fn execute(
        &mut self,
        units: &[SyncUnit],
        existing_row_ids: &HashSet<String>,
        stats: &mut ReconcileStats,
    ) -> Result<()> {
        for note in self.store.list_notes(self.collection_id)? {
            self.index
                .insert((note.partition.clone(), note.row_id.clone()), note);
        }
        for binding in self.store.note_type_bindings(self.collection_id)? {
            self.bindings
                .insert((binding.partition, binding.variant), binding.note_type_id);
        }

        for unit in units {
            if let Err(err) = validate_unit(unit) {
                tracing::debug!(row = %unit.row_id, partition = %unit.partition, error = %err, "Skipping invalid unit");
                stats.errors.push(err.to_string());
                continue;
            }
            if self.apply_unit(unit, stats)? {
                stats.synced_partitions.insert(unit.partition.clone());
            }
        }

        let stale: Vec<i64> = self
            .index
            .values()
            .filter(|note| !existing_row_ids.contains(&note.row_id))
            .map(|note| note.id)
            .collect();
        if !stale.is_empty() {
            tracing::debug!(count = stale.len(), "Deleting notes whose rows are gone");
            stats.deleted += self.store.delete_notes(&stale)?;
        }

        Ok(())
    }

    /// Returns `false` when the unit was skipped over a naming collision.
    fn apply_unit(&mut self, unit: &SyncUnit, stats: &mut ReconcileStats) -> Result<bool> {
        let fields = project_fields(&unit.fields);
        let variant = Variant::detect(fields.get(FIELD_QUESTION).map_or("", String::as_str));
        let path = naming::deck_path_for_fields(self.remote_name, &unit.partition, &fields);
        let key = (unit.partition.clone(), unit.row_id.clone());

        if let Some(existing) = self.index.get(&key) {
            let current = content_hash(&(&fields, &unit.tags));
            let stored = content_hash(&(&existing.fields, &existing.tags));
            if !has_changed(&current, Some(&stored)) {
                return Ok(true);
            }

            let existing_id = existing.id;
            let existing_type = existing.note_type_id;
            let existing_deck = existing.deck_id;
            let deck_moved = existing.deck_path != path.name();

            let stored_variant = self.store.get_note_type(existing_type)?.map(|nt| nt.variant);
            let note_type_id = if stored_variant == Some(variant) {
                existing_type
            } else {
                tracing::debug!(row = %unit.row_id, %variant, "Switching note type");
                match self.resolve_note_type(&unit.partition, variant)? {
                    Ok(id) => id,
                    Err(conflict) => {
                        stats.errors.push(conflict);
                        return Ok(false);
                    }
                }
            };
            let deck_id = if deck_moved {
                self.resolve_deck(&path)?
            } else {
                existing_deck
            };

            let draft = self.draft(unit, fields, deck_id, note_type_id);
            self.store.upsert_note(&draft)?;
            stats.updated += 1;
            if note_type_id != existing_type {
                self.drop_if_unused(existing_type, &unit.partition)?;
            }

            if let Some(note) = self.index.get_mut(&key) {
                note.id = existing_id;
                note.fields = draft.fields;
                note.tags = draft.tags;
                note.deck_id = deck_id;
                note.deck_path = path.name();
                note.note_type_id = note_type_id;
            }
            return Ok(true);
        }

        let note_type_id = match self.resolve_note_type(&unit.partition, variant)? {
            Ok(id) => id,
            Err(conflict) => {
                stats.errors.push(conflict);
                return Ok(false);
            }
        };
        let deck_id = self.resolve_deck(&path)?;
        let draft = self.draft(unit, fields, deck_id, note_type_id);
        let outcome = self.store.upsert_note(&draft)?;
        stats.created += 1;

        let now = chrono::Utc::now().timestamp_millis();
        self.index.insert(
            key,
            LocalNote {
                id: outcome.note_id,
                guid: String::new(),
                collection_id: draft.collection_id,
                row_id: draft.row_id,
                partition: draft.partition,
                fields: draft.fields,
                tags: draft.tags,
                deck_id,
                deck_path: path.name(),
                note_type_id,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(true)
    }

    fn draft(
        &self,
        unit: &SyncUnit,
        fields: std::collections::BTreeMap<String, String>,
        deck_id: i64,
        note_type_id: i64,
    ) -> NoteDraft {
        NoteDraft {
            collection_id: self.collection_id.to_string(),
            row_id: unit.row_id.clone(),
            partition: unit.partition.clone(),
            fields,
            tags: unit.tags.clone(),
            deck_id,
            note_type_id,
        }
    }

    fn resolve_deck(&mut self, path: &crate::model::DeckPath) -> Result<i64> {
        let name = path.name();
        if let Some(id) = self.decks.get(&name) {
            return Ok(*id);
        }
        let id = self.store.ensure_deck_path(path)?;
        self.decks.insert(name, id);
        Ok(id)
    }

    /// Note type for `(partition, variant)`: the bound one, else the one
    /// carrying the canonical name, else a new one. The result is bound.
    ///
    /// The inner `Err` describes a canonical name held by a note type that
    /// another collection has bound; such a type is never adopted.
    fn resolve_note_type(
        &mut self,
        partition: &PartitionKey,
        variant: Variant,
    ) -> Result<std::result::Result<i64, String>> {
        let slot = (partition.clone(), variant);
        if let Some(id) = self.bindings.get(&slot).copied() {
            if self.store.get_note_type(id)?.is_some() {
                return Ok(Ok(id));
            }
            tracing::warn!(note_type = id, %partition, "Bound note type is gone; rebinding");
            self.store.unbind_note_type(self.collection_id, id)?;
            self.bindings.remove(&slot);
        }

        let name = naming::note_type_name(self.remote_name, partition, variant);
        let id = match self.store.find_note_type_by_name(&name)? {
            Some(existing) => {
                let owners = self.store.note_type_owners(existing.id)?;
                if let Some(owner) = owners.iter().find(|o| *o != self.collection_id) {
                    tracing::warn!(%name, owner = %owner, "Note type name taken by another collection");
                    return Ok(Err(format!(
                        "note type '{name}' is bound by collection '{owner}'; rename one of the collections"
                    )));
                }
                existing.id
            }
            None => {
                tracing::debug!(%name, "Creating note type");
                self.store.create_note_type(&name, variant, NOTE_FIELDS)?
            }
        };

        self.store.bind_note_type(&NoteTypeBinding {
            collection_id: self.collection_id.to_string(),
            partition: partition.clone(),
            variant,
            note_type_id: id,
        })?;
        self.bindings.insert(slot, id);
        Ok(Ok(id))
    }

    /// Delete a note type this collection left with no notes.
    fn drop_if_unused(&mut self, note_type_id: i64, partition: &PartitionKey) -> Result<()> {
        if self.store.note_type_usage(note_type_id)? > 0 {
            return Ok(());
        }
        let owners = self.store.note_type_owners(note_type_id)?;
        if owners.iter().any(|owner| owner != self.collection_id) {
            return Ok(());
        }
        tracing::debug!(note_type = note_type_id, %partition, "Dropping unused note type");
        self.store.delete_note_type(note_type_id)?;
        self.bindings.retain(|_, id| *id != note_type_id);
        Ok(())
    }
}
