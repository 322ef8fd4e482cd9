//! Fetch collaborators.
//!
//! A [`RowSource`] turns a collection's source locator into the current
//! snapshot of remote rows. The engine calls it once per collection per run
//! and treats any [`FetchError`] as fatal for that collection only.
//!
//! # Submodules
//!
//! - [`file`] - JSON / JSONL file source

pub mod file;

pub use file::JsonFileSource;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::model::RemoteRow;

/// One fetched snapshot of a remote collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSheet {
    /// Current display name of the remote collection, when the source has one.
    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub rows: Vec<RemoteRow>,
}

impl RemoteSheet {
    #[must_use]
    pub fn new(title: Option<&str>, rows: Vec<RemoteRow>) -> Self {
        Self {
            title: title.map(str::to_string),
            rows,
        }
    }
}

/// Errors raised while fetching a collection.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The locator points at nothing.
    #[error("source not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed content.
    #[error("invalid row at line {line}: {message}")]
    InvalidRecord {
        /// Line number (1-indexed).
        line: usize,
        message: String,
    },

    #[error("invalid document: {0}")]
    InvalidDocument(String),
}

/// Produces the current rows of a remote collection.
pub trait RowSource {
    /// Fetch the snapshot behind `locator`.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`] when the source cannot be read or parsed.
    fn fetch(&self, locator: &str) -> Result<RemoteSheet, FetchError>;
}

/// In-memory source keyed by locator.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    sheets: HashMap<String, RemoteSheet>,
}

impl MemorySource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or replace) the snapshot served for `locator`.
    pub fn insert(&mut self, locator: &str, sheet: RemoteSheet) {
        self.sheets.insert(locator.to_string(), sheet);
    }

    /// Stop serving `locator`; later fetches fail with `NotFound`.
    pub fn remove(&mut self, locator: &str) {
        self.sheets.remove(locator);
    }
}

impl RowSource for MemorySource {
    fn fetch(&self, locator: &str) -> Result<RemoteSheet, FetchError> {
        self.sheets
            .get(locator)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(locator.to_string()))
    }
}

impl<S: RowSource + ?Sized> RowSource for &S {
    fn fetch(&self, locator: &str) -> Result<RemoteSheet, FetchError> {
        (**self).fetch(locator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_source_serves_and_forgets() {
        let mut source = MemorySource::new();
        source.insert("bio", RemoteSheet::new(Some("Biology"), vec![RemoteRow::new("r1")]));

        let sheet = source.fetch("bio").unwrap();
        assert_eq!(sheet.title.as_deref(), Some("Biology"));
        assert_eq!(sheet.rows.len(), 1);

        source.remove("bio");
        assert!(matches!(source.fetch("bio"), Err(FetchError::NotFound(_))));
    }
}
