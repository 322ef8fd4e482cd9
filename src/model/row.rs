//! Source-side records: remote rows and the per-student units they expand into.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Display label for the reserved partition of rows without a student.
pub const MISSING_STUDENT_LABEL: &str = "No Student";

/// The partition a sync unit belongs to.
///
/// Stored as the student name, or as an empty string for the missing marker.
/// Student names are never empty after trimming, so the two cannot collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionKey {
    /// A named student.
    Student(String),
    /// Rows with no student assignment.
    Missing,
}

impl PartitionKey {
    /// Build a student partition.
    #[must_use]
    pub fn student(name: &str) -> Self {
        Self::Student(name.to_string())
    }

    /// Value persisted in `notes.partition_key`.
    #[must_use]
    pub fn storage_key(&self) -> &str {
        match self {
            Self::Student(name) => name,
            Self::Missing => "",
        }
    }

    /// Inverse of [`PartitionKey::storage_key`].
    #[must_use]
    pub fn from_storage_key(key: &str) -> Self {
        if key.is_empty() {
            Self::Missing
        } else {
            Self::Student(key.to_string())
        }
    }

    /// Human-facing label used in deck and note-type names.
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::Student(name) => name,
            Self::Missing => MISSING_STUDENT_LABEL,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

fn default_sync() -> bool {
    true
}

/// One row from the remote source.
///
/// Produced fresh on every sync and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRow {
    /// Stable row identifier, unique within the source.
    pub id: String,

    /// Column name to cell value.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,

    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// Raw student cell, separated by `,`, `;` or `|`.
    #[serde(default, rename = "students")]
    pub students_raw: String,

    /// Rows with the flag cleared are kept in the source but not synced.
    #[serde(default = "default_sync", rename = "sync")]
    pub sync_flag: bool,
}

impl RemoteRow {
    /// Create a syncable row with no fields, tags or students.
    #[must_use]
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            fields: BTreeMap::new(),
            tags: BTreeSet::new(),
            students_raw: String::new(),
            sync_flag: true,
        }
    }

    #[must_use]
    pub fn with_field(mut self, name: &str, value: &str) -> Self {
        self.fields.insert(name.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn with_students(mut self, raw: &str) -> Self {
        self.students_raw = raw.to_string();
        self
    }

    #[must_use]
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync_flag = sync;
        self
    }
}

/// One (row, partition) pair scheduled for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncUnit {
    pub row_id: String,
    pub partition: PartitionKey,
    pub fields: BTreeMap<String, String>,
    pub tags: BTreeSet<String>,
}

impl SyncUnit {
    /// Expand a row into the unit for one partition.
    #[must_use]
    pub fn from_row(row: &RemoteRow, partition: PartitionKey) -> Self {
        Self {
            row_id: row.id.clone(),
            partition,
            fields: row.fields.clone(),
            tags: row.tags.clone(),
        }
    }

    /// Field value, or the empty string when the column is absent.
    #[must_use]
    pub fn field(&self, name: &str) -> &str {
        self.fields.get(name).map_or("", String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_storage_key_roundtrip() {
        let amy = PartitionKey::student("Amy");
        assert_eq!(amy.storage_key(), "Amy");
        assert_eq!(PartitionKey::from_storage_key("Amy"), amy);
        assert_eq!(PartitionKey::from_storage_key(""), PartitionKey::Missing);
        assert_eq!(PartitionKey::Missing.label(), MISSING_STUDENT_LABEL);
    }

    #[test]
    fn test_remote_row_defaults_from_json() {
        let row: RemoteRow = serde_json::from_str(r#"{"id":"r1"}"#).unwrap();
        assert!(row.sync_flag);
        assert!(row.students_raw.is_empty());
        assert!(row.fields.is_empty());

        let row: RemoteRow =
            serde_json::from_str(r#"{"id":"r2","students":"Amy;Bob","sync":false}"#).unwrap();
        assert!(!row.sync_flag);
        assert_eq!(row.students_raw, "Amy;Bob");
    }
}
