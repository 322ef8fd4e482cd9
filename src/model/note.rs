//! Local store entities: notes, note types and decks.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use super::row::PartitionKey;

pub const FIELD_QUESTION: &str = "Question";
pub const FIELD_ANSWER: &str = "Answer";
pub const FIELD_EXPLANATION: &str = "Explanation";
pub const FIELD_IMPORTANCE: &str = "Importance";
pub const FIELD_TOPIC: &str = "Topic";
pub const FIELD_SUBTOPIC: &str = "Subtopic";
pub const FIELD_CONCEPT: &str = "Concept";

/// Declared field list shared by both note-type variants.
pub const NOTE_FIELDS: &[&str] = &[
    FIELD_QUESTION,
    FIELD_ANSWER,
    FIELD_EXPLANATION,
    FIELD_IMPORTANCE,
    FIELD_TOPIC,
    FIELD_SUBTOPIC,
    FIELD_CONCEPT,
];

static CLOZE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{c\d+::").expect("cloze marker pattern is valid"));

/// Card template family of a note type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Variant {
    Basic,
    Cloze,
}

impl Variant {
    /// Pick the variant from question content: any `{{cN::` marker means cloze.
    #[must_use]
    pub fn detect(question: &str) -> Self {
        if CLOZE_MARKER.is_match(question) {
            Self::Cloze
        } else {
            Self::Basic
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "Basic",
            Self::Cloze => "Cloze",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Variant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Basic" => Ok(Self::Basic),
            "Cloze" => Ok(Self::Cloze),
            _ => Err(format!("Unknown note type variant: {s}")),
        }
    }
}

/// Project source fields onto the declared note field list.
///
/// Columns outside [`NOTE_FIELDS`] are dropped; declared fields missing from
/// the source become empty strings.
#[must_use]
pub fn project_fields(source: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    NOTE_FIELDS
        .iter()
        .map(|name| {
            let value = source.get(*name).cloned().unwrap_or_default();
            ((*name).to_string(), value)
        })
        .collect()
}

/// Ordered deck path segments, rendered with `::`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DeckPath(Vec<String>);

impl DeckPath {
    pub const SEPARATOR: &'static str = "::";

    #[must_use]
    pub fn new(segments: Vec<String>) -> Self {
        Self(segments)
    }

    /// Parse a stored `::`-joined deck name.
    #[must_use]
    pub fn parse(name: &str) -> Self {
        Self(name.split(Self::SEPARATOR).map(str::to_string).collect())
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// Names of every ancestor path, shallowest first, including this one.
    #[must_use]
    pub fn ancestry(&self) -> Vec<String> {
        (1..=self.0.len())
            .map(|n| self.0[..n].join(Self::SEPARATOR))
            .collect()
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.0.join(Self::SEPARATOR)
    }
}

impl fmt::Display for DeckPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// A persisted deck.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Deck {
    pub id: i64,
    pub name: String,
}

impl Deck {
    #[must_use]
    pub fn depth(&self) -> usize {
        self.name.matches(DeckPath::SEPARATOR).count() + 1
    }
}

/// A local schema template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NoteType {
    pub id: i64,
    pub name: String,
    pub variant: Variant,
    pub fields: Vec<String>,
}

/// Side-table row: which note type serves a collection partition and variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NoteTypeBinding {
    pub collection_id: String,
    pub partition: PartitionKey,
    pub variant: Variant,
    pub note_type_id: i64,
}

/// A persisted note owned by one collection partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalNote {
    pub id: i64,
    pub guid: String,
    pub collection_id: String,
    pub row_id: String,
    pub partition: PartitionKey,
    pub fields: BTreeMap<String, String>,
    pub tags: BTreeSet<String>,
    pub deck_id: i64,
    /// Full name of `deck_id`, joined in at read time.
    pub deck_path: String,
    pub note_type_id: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Insert-or-update payload keyed by `(collection_id, partition, row_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteDraft {
    pub collection_id: String,
    pub row_id: String,
    pub partition: PartitionKey,
    pub fields: BTreeMap<String, String>,
    pub tags: BTreeSet<String>,
    pub deck_id: i64,
    pub note_type_id: i64,
}

/// Result of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub note_id: i64,
    pub created: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_detect() {
        assert_eq!(Variant::detect("What is 2+2?"), Variant::Basic);
        assert_eq!(Variant::detect("The capital is {{c1::Paris}}"), Variant::Cloze);
        assert_eq!(Variant::detect("{{c12::x}} and {{c2::y}}"), Variant::Cloze);
        assert_eq!(Variant::detect("{{c::broken}}"), Variant::Basic);
        assert_eq!(Variant::detect("{{C1::upper}}"), Variant::Basic);
    }

    #[test]
    fn test_project_fields_fills_and_drops() {
        let mut source = BTreeMap::new();
        source.insert("Question".to_string(), "Q?".to_string());
        source.insert("Unrelated".to_string(), "x".to_string());

        let projected = project_fields(&source);
        assert_eq!(projected.len(), NOTE_FIELDS.len());
        assert_eq!(projected["Question"], "Q?");
        assert_eq!(projected["Answer"], "");
        assert!(!projected.contains_key("Unrelated"));
    }

    #[test]
    fn test_deck_path_ancestry() {
        let path = DeckPath::parse("A::B::C");
        assert_eq!(path.depth(), 3);
        assert_eq!(path.ancestry(), vec!["A", "A::B", "A::B::C"]);
        assert_eq!(path.to_string(), "A::B::C");

        let deck = Deck {
            id: 1,
            name: "A::B".into(),
        };
        assert_eq!(deck.depth(), 2);
    }
}
