//! End-to-end sync scenarios against an in-memory store.

use decksync::model::{Collection, PartitionKey, RemoteRow};
use decksync::source::{MemorySource, RemoteSheet};
use decksync::storage::{ConfigStore, LocalStore, RunJournal, SqliteStorage};
use decksync::sync::{
    AssumeYes, BatchOutcome, NameEnforcement, PurgePlan, RunStatus, SyncEngine, SyncReport,
    note_guid,
};

const SOURCE: &str = "bio-src";

fn question(id: &str, text: &str, students: &str) -> RemoteRow {
    RemoteRow::new(id)
        .with_field("Question", text)
        .with_field("Answer", "answer")
        .with_students(students)
}

fn setup(enabled: &[&str]) -> SqliteStorage {
    let mut storage = SqliteStorage::open_memory().unwrap();
    storage
        .create_collection(&Collection::new("bio", SOURCE))
        .unwrap();
    let enabled: Vec<String> = enabled.iter().map(|s| (*s).to_string()).collect();
    storage
        .update_student_selection("bio", &enabled, &[])
        .unwrap();
    storage
}

fn publish(source: &mut MemorySource, title: &str, rows: Vec<RemoteRow>) {
    source.insert(SOURCE, RemoteSheet::new(Some(title), rows));
}

fn sync(storage: &mut SqliteStorage, source: &MemorySource) -> SyncReport {
    SyncEngine::new(storage, source).run_sync("bio", &mut AssumeYes)
}

fn counts(report: &SyncReport) -> (usize, usize, usize) {
    (report.created, report.updated, report.deleted)
}

fn partitions(storage: &SqliteStorage) -> Vec<(String, String)> {
    storage
        .list_notes("bio")
        .unwrap()
        .into_iter()
        .map(|n| (n.partition.label().to_string(), n.row_id))
        .collect()
}

#[test]
fn create_noop_update_delete() {
    let mut storage = setup(&["Amy", "Bob"]);
    let mut source = MemorySource::new();
    publish(
        &mut source,
        "Biology",
        vec![question("r1", "What is a cell?", "Amy, Bob"), question("r2", "Name an organelle", "Amy")],
    );

    let first = sync(&mut storage, &source);
    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(counts(&first), (3, 0, 0));

    // Unchanged source is a no-op
    let second = sync(&mut storage, &source);
    assert_eq!(counts(&second), (0, 0, 0));
    assert!(second.errors.is_empty());

    publish(
        &mut source,
        "Biology",
        vec![
            question("r1", "What is a cell?", "Amy, Bob").with_field("Answer", "the unit of life"),
            question("r2", "Name an organelle", "Amy"),
        ],
    );
    let third = sync(&mut storage, &source);
    assert_eq!(counts(&third), (0, 2, 0));

    publish(
        &mut source,
        "Biology",
        vec![question("r1", "What is a cell?", "Amy, Bob").with_field("Answer", "the unit of life")],
    );
    let fourth = sync(&mut storage, &source);
    assert_eq!(counts(&fourth), (0, 0, 1));
    assert_eq!(storage.count_notes("bio").unwrap(), 2);
}

#[test]
fn rows_fan_out_to_enabled_students() {
    let mut storage = setup(&["Amy", "Cy"]);
    let mut source = MemorySource::new();
    publish(
        &mut source,
        "Biology",
        vec![
            question("r1", "Q1", "Amy; Bob | Cy"),
            question("r2", "Q2", " , Bob"),
            question("r3", "Q3", "amy"),
        ],
    );

    let report = sync(&mut storage, &source);
    assert_eq!(report.created, 2);
    // r1/Bob, r2/Bob and r3/amy do not match an enabled student
    assert_eq!(report.ignored, 3);
    assert_eq!(report.discovered, vec!["Bob", "amy"]);

    let notes = storage.list_notes("bio").unwrap();
    let decks: Vec<&str> = notes.iter().map(|n| n.deck_path.as_str()).collect();
    assert!(decks.contains(&"DeckSync::Biology::Amy::Unrated::General::General::General"));
    assert!(decks.contains(&"DeckSync::Biology::Cy::Unrated::General::General::General"));
    assert_ne!(notes[0].note_type_id, notes[1].note_type_id);

    for note in &notes {
        assert_eq!(note.guid, note_guid("bio", &note.partition, &note.row_id));
    }
}

#[test]
fn notes_survive_while_their_row_exists() {
    let mut storage = setup(&["Amy", "Bob"]);
    let mut source = MemorySource::new();
    publish(&mut source, "Biology", vec![question("r1", "Q1", "Amy, Bob")]);
    sync(&mut storage, &source);

    // Bob is dropped from the row but stays enabled, and the row is paused
    publish(
        &mut source,
        "Biology",
        vec![question("r1", "Q1", "Amy").with_sync(false)],
    );
    let report = sync(&mut storage, &source);

    assert_eq!(counts(&report), (0, 0, 0));
    assert_eq!(
        partitions(&storage),
        vec![("Amy".to_string(), "r1".to_string()), ("Bob".to_string(), "r1".to_string())]
    );
}

#[test]
fn confirmed_purge_removes_only_disabled_student() {
    let mut storage = setup(&["Amy", "Bob"]);
    let mut source = MemorySource::new();
    publish(
        &mut source,
        "Biology",
        vec![question("r1", "Q1", "Amy, Bob"), question("r2", "Q2", "Bob")],
    );
    sync(&mut storage, &source);
    assert_eq!(storage.count_notes("bio").unwrap(), 3);

    storage
        .update_student_selection("bio", &[], &["Bob".to_string()])
        .unwrap();

    let mut shown = Vec::new();
    let mut approve = |plans: &[PurgePlan]| {
        shown = plans.iter().flat_map(PurgePlan::labels).collect();
        true
    };
    let report = SyncEngine::new(&mut storage, &source).run_sync("bio", &mut approve);

    assert_eq!(shown, vec!["Bob"]);
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.purged_partitions, vec!["Bob"]);
    assert_eq!(report.purged.notes_removed, 2);
    assert_eq!(report.purged.decks_removed, 5);
    assert_eq!(report.purged.note_types_removed, 1);

    assert_eq!(
        partitions(&storage),
        vec![("Amy".to_string(), "r1".to_string())]
    );
    assert!(storage.find_deck_by_name("DeckSync::Biology::Bob").unwrap().is_none());
    assert!(storage.find_deck_by_name("DeckSync::Biology::Amy").unwrap().is_some());
    assert!(!storage.sync_history("bio").unwrap().contains("Bob"));

    // Nothing left to purge on the next run
    let next = sync(&mut storage, &source);
    assert!(next.purged_partitions.is_empty());
    assert_eq!(counts(&next), (0, 0, 0));
}

#[test]
fn declined_purge_leaves_everything_intact() {
    let mut storage = setup(&["Amy", "Bob"]);
    let mut source = MemorySource::new();
    publish(&mut source, "Biology", vec![question("r1", "Q1", "Amy, Bob")]);
    sync(&mut storage, &source);

    storage
        .update_student_selection("bio", &[], &["Bob".to_string()])
        .unwrap();
    // A pending change that must not be applied either
    publish(&mut source, "Biology", vec![question("r1", "Q1 edited", "Amy, Bob")]);

    let mut decline = |_: &[PurgePlan]| false;
    let batch = SyncEngine::new(&mut storage, &source).run_batch(&["bio".to_string()], &mut decline);

    assert_eq!(batch.outcome, BatchOutcome::Declined);
    assert_eq!(batch.reports[0].status, RunStatus::Declined);
    assert_eq!(storage.count_notes("bio").unwrap(), 2);
    assert!(storage.sync_history("bio").unwrap().contains("Bob"));
    let questions: Vec<String> = storage
        .list_notes("bio")
        .unwrap()
        .into_iter()
        .map(|n| n.fields["Question"].clone())
        .collect();
    assert_eq!(questions, vec!["Q1", "Q1"]);
}

#[test]
fn remote_rename_propagates_without_moving_notes() {
    let mut storage = setup(&["Amy"]);
    let mut source = MemorySource::new();
    publish(
        &mut source,
        "Biology",
        vec![question("r1", "Q1", "Amy"), question("r2", "The {{c1::nucleus}} holds DNA", "Amy")],
    );
    sync(&mut storage, &source);
    let before = storage.list_notes("bio").unwrap();
    let root = storage.collection_deck_id("bio").unwrap().unwrap();
    let note_types_before = storage.list_note_types().unwrap().len();
    let decks_before = storage.list_decks().unwrap().len();

    publish(
        &mut source,
        "Bio 101",
        vec![question("r1", "Q1", "Amy"), question("r2", "The {{c1::nucleus}} holds DNA", "Amy")],
    );
    let report = sync(&mut storage, &source);

    assert_eq!(counts(&report), (0, 0, 0));
    assert!(report.names.deck_renamed);
    assert_eq!(report.names.note_types_renamed.len(), 2);
    assert_eq!(storage.remote_collection_name("bio").unwrap().as_deref(), Some("Bio 101"));
    assert_eq!(storage.get_deck(root).unwrap().unwrap().name, "DeckSync::Bio 101");

    let after = storage.list_notes("bio").unwrap();
    assert_eq!(
        before.iter().map(|n| (n.id, n.deck_id)).collect::<Vec<_>>(),
        after.iter().map(|n| (n.id, n.deck_id)).collect::<Vec<_>>()
    );
    for note in &after {
        assert!(note.deck_path.starts_with("DeckSync::Bio 101::Amy::"));
        let note_type = storage.get_note_type(note.note_type_id).unwrap().unwrap();
        assert!(note_type.name.starts_with("DeckSync - Bio 101 - Amy - "));
    }
    assert!(storage.find_deck_by_name("DeckSync::Biology").unwrap().is_none());
    assert_eq!(storage.list_note_types().unwrap().len(), note_types_before);
    assert_eq!(storage.list_decks().unwrap().len(), decks_before);

    let again = sync(&mut storage, &source);
    assert_eq!(again.names, NameEnforcement::default());
}

#[test]
fn same_titled_collections_do_not_share_entities() {
    let mut storage = setup(&["Amy"]);
    storage
        .create_collection(&Collection::new("chem", "chem-src"))
        .unwrap();
    storage
        .update_student_selection("chem", &["Amy".to_string()], &[])
        .unwrap();
    let mut source = MemorySource::new();
    publish(&mut source, "Shared", vec![question("r1", "Q1", "Amy")]);
    source.insert(
        "chem-src",
        RemoteSheet::new(Some("Shared"), vec![question("c1", "C1", "Amy")]),
    );
    let both = ["bio".to_string(), "chem".to_string()];

    let first = SyncEngine::new(&mut storage, &source).run_batch(&both, &mut AssumeYes);
    assert_eq!(first.reports[0].created, 1);
    let chem = &first.reports[1];
    assert_eq!(chem.created, 0);
    assert_eq!(chem.names.errors.len(), 1);
    assert!(chem.errors[0].contains("'bio'"));
    assert_eq!(storage.collection_deck_id("chem").unwrap(), None);

    // Renaming one side frees the name for the other
    publish(&mut source, "Renamed", vec![question("r1", "Q1", "Amy")]);
    let second = SyncEngine::new(&mut storage, &source).run_batch(&both, &mut AssumeYes);
    assert!(second.reports[0].names.deck_renamed);
    assert_eq!(second.reports[1].created, 1);
    assert!(second.reports[1].errors.is_empty());

    let third = SyncEngine::new(&mut storage, &source).run_batch(&both, &mut AssumeYes);
    for report in &third.reports {
        assert_eq!(report.names, NameEnforcement::default());
        assert_eq!(counts(report), (0, 0, 0));
        assert!(report.errors.is_empty());
    }

    let bio_root = storage.collection_deck_id("bio").unwrap().unwrap();
    let chem_root = storage.collection_deck_id("chem").unwrap().unwrap();
    assert_ne!(bio_root, chem_root);
    assert_eq!(storage.get_deck(bio_root).unwrap().unwrap().name, "DeckSync::Renamed");
    assert_eq!(storage.get_deck(chem_root).unwrap().unwrap().name, "DeckSync::Shared");
    let bio_types: Vec<i64> = storage
        .note_type_bindings("bio")
        .unwrap()
        .iter()
        .map(|b| b.note_type_id)
        .collect();
    assert!(storage
        .note_type_bindings("chem")
        .unwrap()
        .iter()
        .all(|b| !bio_types.contains(&b.note_type_id)));
}

#[test]
fn missing_student_partition_follows_policy() {
    let mut storage = setup(&["Amy"]);
    storage.set_missing_student_policy("bio", true).unwrap();
    let mut source = MemorySource::new();
    publish(
        &mut source,
        "Biology",
        vec![question("r1", "Q1", "Amy"), question("r2", "Q2", "")],
    );

    let report = sync(&mut storage, &source);
    assert_eq!(report.created, 2);
    let missing = storage
        .find_note("bio", &PartitionKey::Missing, "r2")
        .unwrap()
        .unwrap();
    assert!(missing.deck_path.starts_with("DeckSync::Biology::No Student::"));

    storage.set_missing_student_policy("bio", false).unwrap();
    let report = sync(&mut storage, &source);
    assert_eq!(report.purged_partitions, vec!["No Student"]);
    assert_eq!(report.purged.notes_removed, 1);
    assert!(storage
        .find_note("bio", &PartitionKey::Missing, "r2")
        .unwrap()
        .is_none());
}

#[test]
fn batch_continues_past_fetch_failure() {
    let mut storage = setup(&["Amy"]);
    storage
        .create_collection(&Collection::new("chem", "chem-src"))
        .unwrap();
    let mut source = MemorySource::new();
    publish(&mut source, "Biology", vec![question("r1", "Q1", "Amy")]);

    let batch = SyncEngine::new(&mut storage, &source)
        .run_batch(&["chem".to_string(), "bio".to_string()], &mut AssumeYes);

    assert_eq!(batch.outcome, BatchOutcome::Completed);
    assert_eq!(batch.reports[0].status, RunStatus::FetchFailed);
    assert_eq!(batch.reports[1].created, 1);
    assert_eq!(storage.recent_sync_runs("bio", 10).unwrap().len(), 1);
    assert!(storage.recent_sync_runs("chem", 10).unwrap().is_empty());
}

#[test]
fn invalid_units_are_counted_not_fatal() {
    let mut storage = setup(&["Amy"]);
    let mut source = MemorySource::new();
    publish(
        &mut source,
        "Biology",
        vec![question("r1", "Q1", "Amy"), question("r2", "   ", "Amy")],
    );

    let report = sync(&mut storage, &source);
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.created, 1);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("r2"));
}
