//! Student partitioner.
//!
//! Expands remote rows into one sync unit per (row, enabled student), plus a
//! missing-student unit for unassigned rows when the policy allows it.

use std::collections::{BTreeSet, HashSet};

use crate::model::{PartitionKey, RemoteRow, SyncUnit};

/// Characters that separate names in a row's student cell.
pub const STUDENT_SEPARATORS: &[char] = &[',', ';', '|'];

/// Degraded configuration detected while partitioning.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("no students are enabled but {rows} rows assign students; nothing was synced")]
    NoStudentsEnabled { rows: usize },
}

/// Output of [`partition`].
#[derive(Debug, Clone, Default)]
pub struct Partitioned {
    /// Units in row order, then student order within a row.
    pub units: Vec<SyncUnit>,
    /// Every row id in the snapshot, whatever its flag or students.
    pub existing_row_ids: HashSet<String>,
    /// Rows and row/student pairs that produced no unit.
    pub ignored: usize,
    /// Every student name seen in any row, in first-seen order.
    pub discovered: Vec<String>,
    pub warning: Option<ConfigurationError>,
}

/// Split a raw student cell into trimmed, non-empty, de-duplicated names.
///
/// Names keep their case; `Amy` and `amy` are different students.
#[must_use]
pub fn split_students(raw: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.split(STUDENT_SEPARATORS)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .filter(|name| seen.insert(*name))
        .map(str::to_string)
        .collect()
}

/// Expand rows into sync units.
#[must_use]
pub fn partition(rows: &[RemoteRow], enabled: &BTreeSet<String>, include_missing: bool) -> Partitioned {
    let mut out = Partitioned::default();
    let mut seen_students = HashSet::new();
    let mut assigned_rows = 0;

    for row in rows {
        out.existing_row_ids.insert(row.id.clone());

        let students = split_students(&row.students_raw);
        for name in &students {
            if seen_students.insert(name.clone()) {
                out.discovered.push(name.clone());
            }
        }
        if !students.is_empty() {
            assigned_rows += 1;
        }

        if !row.sync_flag {
            out.ignored += 1;
            continue;
        }

        if students.is_empty() {
            if include_missing {
                out.units.push(SyncUnit::from_row(row, PartitionKey::Missing));
            } else {
                out.ignored += 1;
            }
            continue;
        }

        for name in students {
            if enabled.contains(&name) {
                out.units.push(SyncUnit::from_row(row, PartitionKey::Student(name)));
            } else {
                out.ignored += 1;
            }
        }
    }

    if enabled.is_empty() && assigned_rows > 0 {
        tracing::warn!(rows = assigned_rows, "No students enabled; skipping all units");
        out.warning = Some(ConfigurationError::NoStudentsEnabled {
            rows: assigned_rows,
        });
        out.ignored += out.units.len();
        out.units.clear();
    }

    out
}
