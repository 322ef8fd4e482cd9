//! Per-collection student selection state.
//!
//! A registry value is loaded from the configuration store when a run starts,
//! mutated while the run discovers and purges students, and written back when
//! the run commits. Nothing about it is process-global.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::row::PartitionKey;

/// Students known to one collection.
///
/// # Invariants
///
/// - `sync_history` only grows through [`StudentRegistry::record_synced`] and
///   only shrinks through [`StudentRegistry::forget`] (after a confirmed purge).
/// - `available` is never pruned automatically; it is discovery data only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentRegistry {
    /// Every student name ever seen in the source.
    pub available: BTreeSet<String>,
    /// Students selected for sync.
    pub enabled: BTreeSet<String>,
    /// Students that were actually synced at least once.
    pub sync_history: BTreeSet<String>,
    /// Whether the missing-student partition has ever been synced.
    pub missing_synced: bool,
}

impl StudentRegistry {
    /// Merge newly seen student names into `available`.
    ///
    /// Returns the names that were not known before.
    pub fn discover<I>(&mut self, names: I) -> Vec<String>
    where
        I: IntoIterator<Item = String>,
    {
        names
            .into_iter()
            .filter(|name| self.available.insert(name.clone()))
            .collect()
    }

    /// Enable students, making them available as a side effect.
    pub fn enable<'a, I>(&mut self, names: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for name in names {
            self.available.insert(name.to_string());
            self.enabled.insert(name.to_string());
        }
    }

    pub fn disable<'a, I>(&mut self, names: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for name in names {
            self.enabled.remove(name);
        }
    }

    /// Record partitions that were reconciled in this run.
    pub fn record_synced<'a, I>(&mut self, partitions: I)
    where
        I: IntoIterator<Item = &'a PartitionKey>,
    {
        for partition in partitions {
            match partition {
                PartitionKey::Student(name) => {
                    self.sync_history.insert(name.clone());
                }
                PartitionKey::Missing => self.missing_synced = true,
            }
        }
    }

    /// Drop purged partitions from the history.
    pub fn forget<'a, I>(&mut self, partitions: I)
    where
        I: IntoIterator<Item = &'a PartitionKey>,
    {
        for partition in partitions {
            match partition {
                PartitionKey::Student(name) => {
                    self.sync_history.remove(name);
                }
                PartitionKey::Missing => self.missing_synced = false,
            }
        }
    }
}
