//! Naming rules for decks and note types.
//!
//! Every name the store holds for a collection is a pure function of the
//! collection's *current* remote name, the partition and (for decks) the
//! taxonomy columns of a row. Callers must always pass the current remote
//! name; comparing the output against what is stored is how renames are
//! detected.
//!
//! # Formats
//!
//! - Deck: `DeckSync::<collection>::<partition>::<importance>::<topic>::<subtopic>::<concept>`
//! - Note type: `DeckSync - <collection> - <partition> - <Basic|Cloze>`

use std::collections::BTreeMap;

use crate::model::note::{FIELD_CONCEPT, FIELD_IMPORTANCE, FIELD_SUBTOPIC, FIELD_TOPIC};
use crate::model::{DeckPath, PartitionKey, Variant};

/// Top-level deck under which every collection lives.
pub const DECK_ROOT: &str = "DeckSync";

/// Leading segment of every managed note-type name.
pub const NOTE_TYPE_PREFIX: &str = "DeckSync";

const NAME_SEPARATOR: &str = " - ";

pub const UNTITLED_COLLECTION: &str = "Untitled";
pub const DEFAULT_IMPORTANCE: &str = "Unrated";
pub const DEFAULT_TOPIC: &str = "General";
pub const DEFAULT_SUBTOPIC: &str = "General";
pub const DEFAULT_CONCEPT: &str = "General";

/// Clean one deck segment, falling back to `placeholder` when blank.
///
/// A segment can never contain the `::` separator; it would silently add a
/// nesting level.
fn segment(value: &str, placeholder: &str) -> String {
    let cleaned = value.trim().replace(DeckPath::SEPARATOR, ":");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        placeholder.to_string()
    } else {
        cleaned.to_string()
    }
}

/// Canonical display form of a remote collection name.
#[must_use]
pub fn collection_label(remote_name: &str) -> String {
    segment(remote_name, UNTITLED_COLLECTION)
}

/// Full deck path for one note.
#[must_use]
pub fn deck_path(
    remote_name: &str,
    partition: &PartitionKey,
    importance: &str,
    topic: &str,
    subtopic: &str,
    concept: &str,
) -> DeckPath {
    DeckPath::new(vec![
        DECK_ROOT.to_string(),
        collection_label(remote_name),
        segment(partition.label(), partition.label()),
        segment(importance, DEFAULT_IMPORTANCE),
        segment(topic, DEFAULT_TOPIC),
        segment(subtopic, DEFAULT_SUBTOPIC),
        segment(concept, DEFAULT_CONCEPT),
    ])
}

/// [`deck_path`] with taxonomy read from a row's fields.
#[must_use]
pub fn deck_path_for_fields(
    remote_name: &str,
    partition: &PartitionKey,
    fields: &BTreeMap<String, String>,
) -> DeckPath {
    let get = |name: &str| fields.get(name).map_or("", String::as_str);
    deck_path(
        remote_name,
        partition,
        get(FIELD_IMPORTANCE),
        get(FIELD_TOPIC),
        get(FIELD_SUBTOPIC),
        get(FIELD_CONCEPT),
    )
}

/// Deck owning everything synced from one collection.
#[must_use]
pub fn collection_deck_path(remote_name: &str) -> DeckPath {
    DeckPath::new(vec![DECK_ROOT.to_string(), collection_label(remote_name)])
}

/// Deck owning one partition of a collection.
#[must_use]
pub fn partition_deck_path(remote_name: &str, partition: &PartitionKey) -> DeckPath {
    DeckPath::new(vec![
        DECK_ROOT.to_string(),
        collection_label(remote_name),
        segment(partition.label(), partition.label()),
    ])
}

/// Canonical note-type name.
#[must_use]
pub fn note_type_name(remote_name: &str, partition: &PartitionKey, variant: Variant) -> String {
    [
        NOTE_TYPE_PREFIX,
        collection_label(remote_name).as_str(),
        partition.label(),
        variant.as_str(),
    ]
    .join(NAME_SEPARATOR)
}

/// Segments recovered from a stored note-type name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedNoteTypeName {
    pub collection: String,
    pub partition: PartitionKey,
    pub variant: Variant,
}

/// Recover collection, partition and variant from a note-type name.
///
/// Positional parsing is ambiguous when a collection name contains `" - "`:
/// the partition is taken as the last segment before the variant, so a
/// student name containing `" - "` is split incorrectly. The side-table of
/// note-type bindings is authoritative; this is only used to adopt note
/// types that predate it.
#[must_use]
pub fn parse_note_type_name(name: &str) -> Option<ParsedNoteTypeName> {
    let rest = name.strip_prefix(NOTE_TYPE_PREFIX)?.strip_prefix(NAME_SEPARATOR)?;
    let (middle, variant) = rest.rsplit_once(NAME_SEPARATOR)?;
    let variant = variant.parse::<Variant>().ok()?;
    let (collection, partition) = middle.rsplit_once(NAME_SEPARATOR)?;
    if collection.is_empty() || partition.is_empty() {
        return None;
    }

    let partition = if partition == crate::model::MISSING_STUDENT_LABEL {
        PartitionKey::Missing
    } else {
        PartitionKey::student(partition)
    };

    Some(ParsedNoteTypeName {
        collection: collection.to_string(),
        partition,
        variant,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deck_path_uses_placeholders() {
        let path = deck_path("Biology", &PartitionKey::student("Amy"), "", "Cells", " ", "");
        assert_eq!(
            path.name(),
            "DeckSync::Biology::Amy::Unrated::Cells::General::General"
        );
    }

    #[test]
    fn test_deck_path_blank_collection_and_missing_partition() {
        let path = deck_path("  ", &PartitionKey::Missing, "High", "", "", "");
        assert_eq!(
            path.segments()[..4],
            ["DeckSync", "Untitled", "No Student", "High"].map(String::from)
        );
    }

    #[test]
    fn test_separator_inside_segment_is_collapsed() {
        let path = deck_path("Bio::Chem", &PartitionKey::student("Amy"), "", "A::B", "", "");
        assert_eq!(path.depth(), 7);
        assert_eq!(path.segments()[1], "Bio:Chem");
        assert_eq!(path.segments()[4], "A:B");
    }

    #[test]
    fn test_deck_path_for_fields_reads_taxonomy() {
        let mut fields = BTreeMap::new();
        fields.insert("Topic".to_string(), "Genetics".to_string());
        fields.insert("Concept".to_string(), "Alleles".to_string());
        let path = deck_path_for_fields("Bio", &PartitionKey::student("Bob"), &fields);
        assert_eq!(
            path.name(),
            "DeckSync::Bio::Bob::Unrated::Genetics::General::Alleles"
        );
    }

    #[test]
    fn test_collection_and_partition_decks_are_prefixes() {
        let amy = PartitionKey::student("Amy");
        let full = deck_path("Bio", &amy, "", "", "", "");
        assert!(full.name().starts_with(&partition_deck_path("Bio", &amy).name()));
        assert!(full.name().starts_with(&collection_deck_path("Bio").name()));
    }

    #[test]
    fn test_note_type_name_format() {
        assert_eq!(
            note_type_name("Biology", &PartitionKey::student("Amy"), Variant::Cloze),
            "DeckSync - Biology - Amy - Cloze"
        );
        assert_eq!(
            note_type_name("", &PartitionKey::Missing, Variant::Basic),
            "DeckSync - Untitled - No Student - Basic"
        );
    }

    #[test]
    fn test_parse_note_type_name() {
        let parsed = parse_note_type_name("DeckSync - Biology - Amy - Basic").unwrap();
        assert_eq!(parsed.collection, "Biology");
        assert_eq!(parsed.partition, PartitionKey::student("Amy"));
        assert_eq!(parsed.variant, Variant::Basic);

        let parsed = parse_note_type_name("DeckSync - Bio - Part 2 - No Student - Cloze").unwrap();
        assert_eq!(parsed.collection, "Bio - Part 2");
        assert_eq!(parsed.partition, PartitionKey::Missing);

        assert!(parse_note_type_name("Basic").is_none());
        assert!(parse_note_type_name("DeckSync - Bio - Amy - Fancy").is_none());
        assert!(parse_note_type_name("Other - Bio - Amy - Basic").is_none());
    }

    #[test]
    fn test_name_roundtrip_through_parser() {
        let name = note_type_name("Chem", &PartitionKey::student("Zoe"), Variant::Basic);
        let parsed = parse_note_type_name(&name).unwrap();
        assert_eq!(
            note_type_name(&parsed.collection, &parsed.partition, parsed.variant),
            name
        );
    }
}
