//! Cleanup coordinator.
//!
//! Removing a student from the enabled set does not delete anything by
//! itself. The next run plans a purge of every partition that was synced
//! before but is no longer enabled, asks for confirmation, and only then
//! deletes the partition's notes, its now-empty decks and its unused note
//! types.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::error::Result;
use crate::model::{Deck, PartitionKey, StudentRegistry};
use crate::naming;
use crate::storage::LocalStore;
use crate::sync::types::PurgeStats;

/// Students that were synced before but are no longer enabled.
///
/// Never includes the missing-student partition.
#[must_use]
pub fn detect_removed_partitions(
    enabled: &BTreeSet<String>,
    sync_history: &BTreeSet<String>,
) -> Vec<String> {
    sync_history.difference(enabled).cloned().collect()
}

/// Partitions scheduled for removal in one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgePlan {
    pub collection_id: String,
    pub students: Vec<String>,
    /// Purge the missing-student partition as well.
    pub include_missing: bool,
}

impl PurgePlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.students.is_empty() && !self.include_missing
    }

    #[must_use]
    pub fn partitions(&self) -> Vec<PartitionKey> {
        let mut partitions: Vec<PartitionKey> = self
            .students
            .iter()
            .map(|name| PartitionKey::student(name))
            .collect();
        if self.include_missing {
            partitions.push(PartitionKey::Missing);
        }
        partitions
    }

    /// Display labels of the planned partitions.
    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        self.partitions()
            .iter()
            .map(|p| p.label().to_string())
            .collect()
    }
}

/// Build the purge plan for a collection. Pure.
///
/// The missing-student partition is included when the policy is off and it
/// was synced before.
#[must_use]
pub fn plan(collection_id: &str, registry: &StudentRegistry, include_missing: bool) -> PurgePlan {
    PurgePlan {
        collection_id: collection_id.to_string(),
        students: detect_removed_partitions(&registry.enabled, &registry.sync_history),
        include_missing: !include_missing && registry.missing_synced,
    }
}

/// Gate between planning and executing a purge.
pub trait ConfirmPurge {
    /// Approve or decline every non-empty plan of a batch at once.
    fn confirm(&mut self, plans: &[PurgePlan]) -> bool;
}

/// Approves every purge.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeYes;

impl ConfirmPurge for AssumeYes {
    fn confirm(&mut self, _plans: &[PurgePlan]) -> bool {
        true
    }
}

impl<F> ConfirmPurge for F
where
    F: FnMut(&[PurgePlan]) -> bool,
{
    fn confirm(&mut self, plans: &[PurgePlan]) -> bool {
        self(plans)
    }
}

/// Execute a confirmed plan.
///
/// Order: notes, then empty decks deepest first, then note types left with
/// no notes. `remote_name` must be the collection's current remote name.
///
/// # Errors
///
/// Returns an error if the store fails.
pub fn execute<S: LocalStore + ?Sized>(
    store: &mut S,
    plan: &PurgePlan,
    remote_name: &str,
) -> Result<PurgeStats> {
    let mut stats = PurgeStats::default();
    let collection_id = plan.collection_id.as_str();

    for partition in plan.partitions() {
        // Decks that held this partition's notes, wherever they live
        let mut candidates: HashMap<i64, Deck> = store
            .list_notes(collection_id)?
            .into_iter()
            .filter(|note| note.partition == partition)
            .map(|note| {
                (
                    note.deck_id,
                    Deck {
                        id: note.deck_id,
                        name: note.deck_path,
                    },
                )
            })
            .collect();

        stats.notes_removed += store.delete_partition_notes(collection_id, &partition)?;

        let root = naming::partition_deck_path(remote_name, &partition).name();
        for deck in store.deck_subtree(&root)? {
            candidates.insert(deck.id, deck);
        }
        let mut decks: Vec<Deck> = candidates.into_values().collect();
        decks.sort_by(|a, b| b.depth().cmp(&a.depth()).then_with(|| a.name.cmp(&b.name)));
        for deck in decks {
            if store.deck_is_empty(deck.id)? {
                store.delete_deck(deck.id)?;
                stats.decks_removed += 1;
            }
        }

        for binding in store
            .note_type_bindings(collection_id)?
            .into_iter()
            .filter(|b| b.partition == partition)
        {
            if store.note_type_usage(binding.note_type_id)? == 0 {
                store.delete_note_type(binding.note_type_id)?;
                stats.note_types_removed += 1;
            }
        }

        tracing::info!(
            collection = collection_id,
            %partition,
            notes = stats.notes_removed,
            "Purged partition"
        );
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Collection, DeckPath, NOTE_FIELDS, NoteDraft, NoteTypeBinding, Variant};
    use crate::storage::SqliteStorage;
    use std::collections::BTreeMap;

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    fn seed(storage: &mut SqliteStorage, partition: PartitionKey, row: &str, deck: &str) {
        let name = naming::note_type_name("Bio", &partition, Variant::Basic);
        let nt = match storage.find_note_type_by_name(&name).unwrap() {
            Some(nt) => nt.id,
            None => {
                let id = storage.create_note_type(&name, Variant::Basic, NOTE_FIELDS).unwrap();
                storage
                    .bind_note_type(&NoteTypeBinding {
                        collection_id: "bio".into(),
                        partition: partition.clone(),
                        variant: Variant::Basic,
                        note_type_id: id,
                    })
                    .unwrap();
                id
            }
        };
        let deck_id = storage.ensure_deck_path(&DeckPath::parse(deck)).unwrap();
        storage
            .upsert_note(&NoteDraft {
                collection_id: "bio".into(),
                row_id: row.into(),
                partition,
                fields: BTreeMap::new(),
                tags: BTreeSet::new(),
                deck_id,
                note_type_id: nt,
            })
            .unwrap();
    }

    #[test]
    fn test_detect_removed_partitions() {
        let removed = detect_removed_partitions(&names(&["Amy"]), &names(&["Amy", "Bob", "Cy"]));
        assert_eq!(removed, vec!["Bob", "Cy"]);
        assert!(detect_removed_partitions(&names(&["Amy", "Dan"]), &names(&["Amy"])).is_empty());
    }

    #[test]
    fn test_plan_is_pure_and_respects_missing_policy() {
        let registry = StudentRegistry {
            enabled: names(&["Amy"]),
            sync_history: names(&["Amy", "Bob"]),
            missing_synced: true,
            ..StudentRegistry::default()
        };

        let with_missing_on = plan("bio", &registry, true);
        assert_eq!(with_missing_on.students, vec!["Bob"]);
        assert!(!with_missing_on.include_missing);

        let with_missing_off = plan("bio", &registry, false);
        assert!(with_missing_off.include_missing);
        assert_eq!(with_missing_off.labels(), vec!["Bob", "No Student"]);

        assert!(plan("bio", &StudentRegistry::default(), false).is_empty());
    }

    #[test]
    fn test_execute_removes_only_planned_partition() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        storage
            .create_collection(&Collection::new("bio", "mem"))
            .unwrap();
        seed(&mut storage, PartitionKey::student("Amy"), "r1", "DeckSync::Bio::Amy::High::Cells");
        seed(&mut storage, PartitionKey::student("Bob"), "r1", "DeckSync::Bio::Bob::High::Cells");
        seed(&mut storage, PartitionKey::student("Bob"), "r2", "DeckSync::Bio::Bob::Low");

        let plan = PurgePlan {
            collection_id: "bio".into(),
            students: vec!["Bob".into()],
            include_missing: false,
        };
        let stats = execute(&mut storage, &plan, "Bio").unwrap();

        assert_eq!(stats.notes_removed, 2);
        // Bob::High::Cells, Bob::High, Bob::Low, Bob
        assert_eq!(stats.decks_removed, 4);
        assert_eq!(stats.note_types_removed, 1);

        let remaining = storage.list_notes("bio").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].partition, PartitionKey::student("Amy"));
        assert!(storage.find_deck_by_name("DeckSync::Bio").unwrap().is_some());
        assert!(storage.find_deck_by_name("DeckSync::Bio::Bob").unwrap().is_none());
        assert_eq!(storage.note_type_bindings("bio").unwrap().len(), 1);
    }

    #[test]
    fn test_confirm_closure_and_assume_yes() {
        let plans = vec![PurgePlan::default()];
        assert!(AssumeYes.confirm(&plans));

        let mut seen = 0;
        let mut decline = |p: &[PurgePlan]| {
            seen = p.len();
            false
        };
        assert!(!decline.confirm(&plans));
        assert_eq!(seen, 1);
    }
}
