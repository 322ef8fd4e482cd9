//! File-backed row source.
//!
//! Accepts three layouts, detected from the first non-blank character:
//!
//! - a JSON object `{"title": "...", "rows": [...]}`
//! - a bare JSON array of rows
//! - JSONL with one row object per line
//!
//! A document that starts with `{` but has no `rows` key is read as JSONL,
//! so a one-line JSONL file still parses.

use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::Deserialize;

use super::{FetchError, RemoteSheet, RowSource};
use crate::model::RemoteRow;

/// Reads collections from JSON or JSONL files; the locator is a path.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFileSource;

#[derive(Deserialize)]
struct SheetDocument {
    #[serde(default)]
    title: Option<String>,
    rows: Vec<RemoteRow>,
}

impl JsonFileSource {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl RowSource for JsonFileSource {
    fn fetch(&self, locator: &str) -> Result<RemoteSheet, FetchError> {
        let path = Path::new(locator);
        if !path.exists() {
            return Err(FetchError::NotFound(path.display().to_string()));
        }

        let content = fs::read_to_string(path)?;
        let trimmed = content.trim_start();

        if trimmed.starts_with('[') {
            let rows: Vec<RemoteRow> = serde_json::from_str(trimmed)
                .map_err(|e| FetchError::InvalidDocument(e.to_string()))?;
            return Ok(RemoteSheet { title: None, rows });
        }

        if trimmed.starts_with('{') {
            if let Ok(doc) = serde_json::from_str::<SheetDocument>(trimmed) {
                let title = doc.title.filter(|t| !t.trim().is_empty());
                return Ok(RemoteSheet {
                    title,
                    rows: doc.rows,
                });
            }
        }

        Ok(RemoteSheet {
            title: None,
            rows: read_jsonl(path)?,
        })
    }
}

/// Read rows from a JSONL file, one object per line.
///
/// Blank lines are skipped.
///
/// # Errors
///
/// Returns `InvalidRecord` with the 1-indexed line number of the first
/// malformed line.
pub fn read_jsonl(path: &Path) -> Result<Vec<RemoteRow>, FetchError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut rows = Vec::new();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }

        let row: RemoteRow =
            serde_json::from_str(&line).map_err(|e| FetchError::InvalidRecord {
                line: line_num + 1,
                message: e.to_string(),
            })?;
        rows.push(row);
    }

    Ok(rows)
}
