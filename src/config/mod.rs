//! Configuration management.
//!
//! Resolves where the local store lives and who is recorded as the actor on
//! audit events. Per-collection sync settings are not file-based; they live
//! in the store's `collection_config` table (see [`crate::storage::ConfigStore`]).
//!
//! # Layout
//!
//! - **Database**: `~/.decksync/data/decksync.db`
//! - **Test database**: `~/.decksync/test/decksync.db` (with `DECKSYNC_TEST_DB=1`)

use std::path::{Path, PathBuf};

/// Get the global decksync directory location (`~/.decksync/`).
#[must_use]
pub fn global_decksync_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|b| b.home_dir().join(".decksync"))
}

/// Whether an environment flag value counts as "on".
fn flag_enabled(value: &str) -> bool {
    !value.is_empty() && value != "0" && value.to_lowercase() != "false"
}

/// Check if test mode is enabled.
///
/// Test mode is enabled by setting `DECKSYNC_TEST_DB=1` (or any non-empty
/// value other than `0` / `false`). This redirects all database operations
/// to an isolated test database.
#[must_use]
pub fn is_test_mode() -> bool {
    std::env::var("DECKSYNC_TEST_DB")
        .map(|v| flag_enabled(&v))
        .unwrap_or(false)
}

/// Get the test database path.
#[must_use]
pub fn test_db_path() -> Option<PathBuf> {
    global_decksync_dir().map(|dir| dir.join("test").join("decksync.db"))
}

/// Resolve the database path.
///
/// Priority:
/// 1. If `explicit_path` is provided, use it directly
/// 2. `DECKSYNC_TEST_DB` environment variable → uses test database
/// 3. `DECKSYNC_DB` environment variable
/// 4. Global location: `~/.decksync/data/decksync.db`
///
/// `--db` is declared with `env = "DECKSYNC_DB"`, so from the CLI the
/// variable arrives as the explicit path; step 3 covers library callers.
///
/// # Returns
///
/// Returns the path to the database file, or `None` if no home directory
/// can be found.
#[must_use]
pub fn resolve_db_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return Some(path.to_path_buf());
    }

    if is_test_mode() {
        return test_db_path();
    }

    if let Ok(db_path) = std::env::var("DECKSYNC_DB") {
        if !db_path.trim().is_empty() {
            return Some(PathBuf::from(db_path));
        }
    }

    global_decksync_dir().map(|dir| dir.join("data").join("decksync.db"))
}

/// Get the default actor name.
///
/// Priority:
/// 1. `DECKSYNC_ACTOR` environment variable
/// 2. Git user name
/// 3. System username
/// 4. "unknown"
#[must_use]
pub fn default_actor() -> String {
    if let Ok(actor) = std::env::var("DECKSYNC_ACTOR") {
        if !actor.is_empty() {
            return actor;
        }
    }

    if let Ok(output) = std::process::Command::new("git")
        .args(["config", "user.name"])
        .output()
    {
        if output.status.success() {
            let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !name.is_empty() {
                return name;
            }
        }
    }

    if let Ok(user) = std::env::var("USER") {
        return user;
    }

    "unknown".to_string()
}
