//! Name consistency enforcer.
//!
//! Keeps stored deck and note-type names equal to what the naming rules
//! produce for the collection's current remote name. Entities are found by
//! id and renamed in place, so a remote rename never orphans notes.

use std::collections::{BTreeMap, HashSet};

use crate::error::Result;
use crate::model::{DeckPath, NoteTypeBinding};
use crate::naming;
use crate::storage::{ConfigStore, LocalStore};
use crate::sync::types::NameEnforcement;

/// Names a collection's entities should carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalNames {
    /// Root deck of the collection.
    pub deck_prefix: DeckPath,
    /// Note type id to canonical name.
    pub note_types: BTreeMap<i64, String>,
}

/// Compute canonical names for every note type known to a collection.
///
/// Note types used by the collection's notes but missing from the
/// side-table are adopted first: their partition comes from a positional
/// parse of the stored name, falling back to the note's own partition.
/// Side-table entries whose note type no longer exists are dropped and
/// counted in the returned `orphans_dropped`.
///
/// # Errors
///
/// Returns an error if the store fails.
pub fn canonical_names<S: LocalStore + ?Sized>(
    store: &mut S,
    collection_id: &str,
    remote_name: &str,
) -> Result<(CanonicalNames, usize)> {
    adopt_unbound_note_types(store, collection_id)?;

    let mut note_types = BTreeMap::new();
    let mut orphans = 0;
    for binding in store.note_type_bindings(collection_id)? {
        if store.get_note_type(binding.note_type_id)?.is_none() {
            tracing::warn!(
                collection = collection_id,
                note_type = binding.note_type_id,
                "Dropping binding to missing note type"
            );
            store.unbind_note_type(collection_id, binding.note_type_id)?;
            orphans += 1;
            continue;
        }
        note_types.insert(
            binding.note_type_id,
            naming::note_type_name(remote_name, &binding.partition, binding.variant),
        );
    }

    Ok((
        CanonicalNames {
            deck_prefix: naming::collection_deck_path(remote_name),
            note_types,
        },
        orphans,
    ))
}

fn adopt_unbound_note_types<S: LocalStore + ?Sized>(
    store: &mut S,
    collection_id: &str,
) -> Result<()> {
    let bindings = store.note_type_bindings(collection_id)?;
    let mut bound: HashSet<i64> = bindings.iter().map(|b| b.note_type_id).collect();
    let mut slots: HashSet<_> = bindings
        .iter()
        .map(|b| (b.partition.clone(), b.variant))
        .collect();

    for note in store.list_notes(collection_id)? {
        if bound.contains(&note.note_type_id) {
            continue;
        }
        let Some(note_type) = store.get_note_type(note.note_type_id)? else {
            continue;
        };
        if !store.note_type_owners(note_type.id)?.is_empty() {
            continue;
        }
        let partition = naming::parse_note_type_name(&note_type.name)
            .map_or_else(|| note.partition.clone(), |parsed| parsed.partition);
        let slot = (partition.clone(), note_type.variant);
        if slots.contains(&slot) {
            continue;
        }

        tracing::debug!(
            collection = collection_id,
            note_type = %note_type.name,
            "Adopting unbound note type"
        );
        store.bind_note_type(&NoteTypeBinding {
            collection_id: collection_id.to_string(),
            partition,
            variant: note_type.variant,
            note_type_id: note_type.id,
        })?;
        bound.insert(note_type.id);
        slots.insert(slot);
    }
    Ok(())
}

/// Rename the collection deck and note types to their canonical names.
///
/// A rename whose target name is already taken by another entity is
/// recorded as an error and skipped; entities are never merged. When the
/// collection has no recorded root deck yet, a deck already carrying the
/// canonical prefix is recorded as its root, unless another collection
/// records it. Decks and note types shared with another collection are
/// reported and never renamed.
///
/// # Errors
///
/// Returns an error if the store fails.
pub fn enforce_names<S: LocalStore + ConfigStore + ?Sized>(
    store: &mut S,
    collection_id: &str,
    canonical: &CanonicalNames,
) -> Result<NameEnforcement> {
    let mut result = NameEnforcement::default();
    let prefix = canonical.deck_prefix.name();

    let recorded = match store.collection_deck_id(collection_id)? {
        Some(id) => store.get_deck(id)?,
        None => None,
    };
    match recorded {
        Some(deck) if deck.name != prefix => {
            let shared = store.deck_root_owner(deck.id, collection_id)?;
            match (shared, store.find_deck_by_name(&prefix)?) {
                (Some(owner), _) => {
                    result.errors.push(format!(
                        "cannot rename deck '{}' to '{prefix}': it is also the root of collection '{owner}'",
                        deck.name
                    ));
                }
                (None, Some(taken)) => {
                    result.errors.push(format!(
                        "cannot rename deck '{}' to '{prefix}': name used by deck {}",
                        deck.name, taken.id
                    ));
                }
                (None, None) => {
                    tracing::info!(collection = collection_id, from = %deck.name, to = %prefix, "Renaming collection deck");
                    store.rename_deck(deck.id, &prefix)?;
                    result.deck_renamed = true;
                }
            }
        }
        Some(_) => {}
        None => {
            let found = store.find_deck_by_name(&prefix)?;
            let stored = store.collection_deck_id(collection_id)?;
            match found {
                Some(deck) => match store.deck_root_owner(deck.id, collection_id)? {
                    Some(owner) => result.errors.push(format!(
                        "deck '{prefix}' is the root of collection '{owner}'"
                    )),
                    None => {
                        if stored != Some(deck.id) {
                            store.set_collection_deck_id(collection_id, Some(deck.id))?;
                        }
                    }
                },
                None => {
                    if stored.is_some() {
                        store.set_collection_deck_id(collection_id, None)?;
                    }
                }
            }
        }
    }

    for (id, name) in &canonical.note_types {
        let Some(note_type) = store.get_note_type(*id)? else {
            continue;
        };
        if &note_type.name == name {
            continue;
        }
        if let Some(owner) = store
            .note_type_owners(*id)?
            .into_iter()
            .find(|owner| owner != collection_id)
        {
            result.errors.push(format!(
                "cannot rename note type '{}' to '{name}': it is also bound by collection '{owner}'",
                note_type.name
            ));
            continue;
        }
        match store.find_note_type_by_name(name)? {
            Some(taken) if taken.id != *id => {
                result.errors.push(format!(
                    "cannot rename note type '{}' to '{name}': name used by note type {}",
                    note_type.name, taken.id
                ));
            }
            _ => {
                tracing::debug!(from = %note_type.name, to = %name, "Renaming note type");
                store.rename_note_type(*id, name)?;
                result.note_types_renamed.push(*id);
            }
        }
    }

    Ok(result)
}

/// [`canonical_names`] followed by [`enforce_names`].
///
/// # Errors
///
/// Returns an error if the store fails.
pub fn enforce_collection_names<S: LocalStore + ConfigStore + ?Sized>(
    store: &mut S,
    collection_id: &str,
    remote_name: &str,
) -> Result<NameEnforcement> {
    let (canonical, orphans) = canonical_names(store, collection_id, remote_name)?;
    let mut result = enforce_names(store, collection_id, &canonical)?;
    result.orphans_dropped = orphans;
    Ok(result)
}

/// Describe a collision when the deck carrying the collection's canonical
/// prefix is recorded as the root of another collection.
///
/// A collection whose own recorded root is that deck never collides.
///
/// # Errors
///
/// Returns an error if the store fails.
pub fn root_deck_conflict<S: LocalStore + ConfigStore + ?Sized>(
    store: &S,
    collection_id: &str,
    remote_name: &str,
) -> Result<Option<String>> {
    let prefix = naming::collection_deck_path(remote_name).name();
    let Some(deck) = store.find_deck_by_name(&prefix)? else {
        return Ok(None);
    };
    if store.collection_deck_id(collection_id)? == Some(deck.id) {
        return Ok(None);
    }
    Ok(store.deck_root_owner(deck.id, collection_id)?.map(|owner| {
        format!("remote name '{remote_name}' collides with collection '{owner}', which owns deck '{prefix}'")
    }))
}
