//! Collection model.
//!
//! A collection is one registered remote source. Its remote display name,
//! student selection and root deck live in the configuration store, keyed by
//! the collection id.

use serde::{Deserialize, Serialize};

/// A registered remote source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    /// Stable local identifier chosen at registration.
    pub id: String,

    /// Locator handed to the fetch collaborator (a file path for the
    /// bundled JSON source).
    pub source: String,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl Collection {
    #[must_use]
    pub fn new(id: &str, source: &str) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: id.to_string(),
            source: source.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}
