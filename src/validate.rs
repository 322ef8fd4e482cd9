//! Input validation.
//!
//! Two kinds of checks live here:
//! - argument validation for the CLI (collection ids, on/off toggles), with
//!   synonym lookup so `yes`/`true`/`1` all work
//! - per-unit validation for reconciliation, which yields a recoverable
//!   [`ValidationError`] instead of aborting the run

use std::collections::HashMap;
use std::sync::LazyLock;

use crate::error::{Error, Result};
use crate::model::SyncUnit;
use crate::model::note::FIELD_QUESTION;

// ── Toggle synonyms ──────────────────────────────────────────

pub static TOGGLE_SYNONYMS: LazyLock<HashMap<&str, bool>> = LazyLock::new(|| {
    [
        ("on", true),
        ("yes", true),
        ("true", true),
        ("1", true),
        ("enable", true),
        ("enabled", true),
        ("off", false),
        ("no", false),
        ("false", false),
        ("0", false),
        ("disable", false),
        ("disabled", false),
    ]
    .into_iter()
    .collect()
});

/// Parse an on/off toggle value.
///
/// # Errors
///
/// Returns `InvalidArgument` for anything that is not a known synonym.
pub fn parse_toggle(value: &str) -> Result<bool> {
    TOGGLE_SYNONYMS
        .get(value.trim().to_lowercase().as_str())
        .copied()
        .ok_or_else(|| Error::InvalidArgument(format!("invalid toggle '{value}'")))
}

/// Validate a collection id: non-empty ASCII letters, digits, `-` and `_`.
///
/// # Errors
///
/// Returns `InvalidArgument` describing the first problem found.
pub fn validate_collection_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidArgument("collection id cannot be empty".into()));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(Error::InvalidArgument(format!(
            "collection id '{id}' contains '{bad}'"
        )));
    }
    Ok(())
}

/// A unit that cannot be turned into a note.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("row has an empty id")]
    EmptyRowId,

    #[error("row {row_id} ({partition}): required field '{field}' is empty")]
    MissingField {
        row_id: String,
        partition: String,
        field: &'static str,
    },
}

/// Check that a unit carries everything a note needs.
///
/// # Errors
///
/// Returns the first failed requirement.
pub fn validate_unit(unit: &SyncUnit) -> std::result::Result<(), ValidationError> {
    if unit.row_id.trim().is_empty() {
        return Err(ValidationError::EmptyRowId);
    }
    if unit.field(FIELD_QUESTION).trim().is_empty() {
        return Err(ValidationError::MissingField {
            row_id: unit.row_id.clone(),
            partition: unit.partition.label().to_string(),
            field: FIELD_QUESTION,
        });
    }
    Ok(())
}
