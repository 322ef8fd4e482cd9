//! Database schema definitions.
//!
//! Decks and note types are keyed by integer ids so they can be renamed
//! without touching the notes that reference them.

use rusqlite::{Connection, Result};

/// Current schema version for migration tracking.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// The complete SQL schema for the decksync database.
///
/// Note: Timestamps are stored as INTEGER (Unix milliseconds).
pub const SCHEMA_SQL: &str = r"
-- ====================
-- Schema Version Tracking
-- ====================

CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at INTEGER NOT NULL
);

-- ====================
-- Configuration
-- ====================

-- Collections: registered remote sources
CREATE TABLE IF NOT EXISTS collections (
    id TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Collection config: whole-value JSON per key
CREATE TABLE IF NOT EXISTS collection_config (
    collection_id TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (collection_id, key)
);

-- ====================
-- Local Record Store
-- ====================

-- Decks: '::'-separated hierarchical names
CREATE TABLE IF NOT EXISTS decks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Note types: schema templates
CREATE TABLE IF NOT EXISTS note_types (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    variant TEXT NOT NULL CHECK (variant IN ('Basic', 'Cloze')),
    fields TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Note type bindings: (collection, partition, variant) -> note type
CREATE TABLE IF NOT EXISTS note_type_bindings (
    collection_id TEXT NOT NULL,
    partition_key TEXT NOT NULL,
    variant TEXT NOT NULL CHECK (variant IN ('Basic', 'Cloze')),
    note_type_id INTEGER NOT NULL,
    PRIMARY KEY (collection_id, partition_key, variant),
    FOREIGN KEY (note_type_id) REFERENCES note_types(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_bindings_note_type ON note_type_bindings(note_type_id);

-- Notes: one per (collection, partition, row)
CREATE TABLE IF NOT EXISTS notes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    guid TEXT NOT NULL UNIQUE,
    collection_id TEXT NOT NULL,
    partition_key TEXT NOT NULL,
    row_id TEXT NOT NULL,
    note_type_id INTEGER NOT NULL,
    deck_id INTEGER NOT NULL,
    fields TEXT NOT NULL DEFAULT '{}',
    tags TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (collection_id, partition_key, row_id),
    FOREIGN KEY (note_type_id) REFERENCES note_types(id),
    FOREIGN KEY (deck_id) REFERENCES decks(id)
);

CREATE INDEX IF NOT EXISTS idx_notes_collection ON notes(collection_id);
CREATE INDEX IF NOT EXISTS idx_notes_partition ON notes(collection_id, partition_key);
CREATE INDEX IF NOT EXISTS idx_notes_deck ON notes(deck_id);
CREATE INDEX IF NOT EXISTS idx_notes_note_type ON notes(note_type_id);

-- ====================
-- History
-- ====================

-- Audit events
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    actor TEXT NOT NULL,
    old_value TEXT,
    new_value TEXT,
    comment TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id);

-- Sync run journal
CREATE TABLE IF NOT EXISTS sync_runs (
    run_id TEXT NOT NULL,
    collection_id TEXT NOT NULL,
    status TEXT NOT NULL,
    created INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0,
    ignored INTEGER NOT NULL DEFAULT 0,
    errors TEXT NOT NULL DEFAULT '[]',
    started_at INTEGER NOT NULL,
    finished_at INTEGER NOT NULL,
    PRIMARY KEY (run_id, collection_id)
);

CREATE INDEX IF NOT EXISTS idx_sync_runs_collection ON sync_runs(collection_id, finished_at DESC);
";

/// Apply the schema to the database.
///
/// This uses `execute_batch` to run the entire DDL script.
/// It is idempotent because all statements use `IF NOT EXISTS`.
///
/// # Errors
///
/// Returns an error if the SQL execution fails or pragmas cannot be set.
pub fn apply_schema(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;

    conn.execute_batch(SCHEMA_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
        rusqlite::params![
            format!("v{CURRENT_SCHEMA_VERSION}"),
            chrono::Utc::now().timestamp_millis()
        ],
    )?;

    Ok(())
}
