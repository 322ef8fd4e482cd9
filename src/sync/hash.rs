//! Hashing for sync operations.
//!
//! SHA256 is used twice: to derive a stable note guid from a note's
//! composite key, and to fingerprint note content so reconciliation can tell
//! an unchanged note from one that needs an update.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::model::PartitionKey;

/// Compute a SHA256 hash of a serializable value.
///
/// The value is first serialized to JSON, then hashed.
///
/// # Panics
///
/// Panics if the value cannot be serialized to JSON. This should never happen
/// for our data types which are all serializable.
#[must_use]
pub fn content_hash<T: Serialize>(value: &T) -> String {
    let json = serde_json::to_string(value).expect("serialization should not fail");
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Check if content has changed against a stored fingerprint.
///
/// Returns `true` if there is no stored hash or the hashes differ.
#[must_use]
pub fn has_changed(current_hash: &str, stored_hash: Option<&str>) -> bool {
    stored_hash.map_or(true, |h| h != current_hash)
}

/// Stable guid for the note keyed by `(collection, partition, row)`.
///
/// Components are NUL-separated so `("a", "bc")` and `("ab", "c")` differ.
/// The missing-student partition hashes its storage key, never its label.
#[must_use]
pub fn note_guid(collection_id: &str, partition: &PartitionKey, row_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(collection_id.as_bytes());
    hasher.update([0]);
    hasher.update(partition.storage_key().as_bytes());
    hasher.update([0]);
    hasher.update(row_id.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..32].to_string()
}
