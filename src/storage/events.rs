//! Audit event storage and retrieval.
//!
//! Every store mutation made during a sync is recorded here, inside the same
//! transaction as the mutation itself.

use rusqlite::{Connection, Result};

/// Event types for audit logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    // Collection events
    CollectionAdded,
    CollectionRemoved,
    ConfigChanged,

    // Note events
    NoteCreated,
    NoteUpdated,
    NoteDeleted,

    // Deck events
    DeckCreated,
    DeckRenamed,
    DeckDeleted,

    // Note type events
    NoteTypeCreated,
    NoteTypeRenamed,
    NoteTypeDeleted,
}

impl EventType {
    /// Get the string representation for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CollectionAdded => "collection_added",
            Self::CollectionRemoved => "collection_removed",
            Self::ConfigChanged => "config_changed",
            Self::NoteCreated => "note_created",
            Self::NoteUpdated => "note_updated",
            Self::NoteDeleted => "note_deleted",
            Self::DeckCreated => "deck_created",
            Self::DeckRenamed => "deck_renamed",
            Self::DeckDeleted => "deck_deleted",
            Self::NoteTypeCreated => "note_type_created",
            Self::NoteTypeRenamed => "note_type_renamed",
            Self::NoteTypeDeleted => "note_type_deleted",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "collection_added" => Self::CollectionAdded,
            "collection_removed" => Self::CollectionRemoved,
            "config_changed" => Self::ConfigChanged,
            "note_created" => Self::NoteCreated,
            "note_updated" => Self::NoteUpdated,
            "note_deleted" => Self::NoteDeleted,
            "deck_created" => Self::DeckCreated,
            "deck_renamed" => Self::DeckRenamed,
            "deck_deleted" => Self::DeckDeleted,
            "note_type_created" => Self::NoteTypeCreated,
            "note_type_renamed" => Self::NoteTypeRenamed,
            "note_type_deleted" => Self::NoteTypeDeleted,
            _ => return None,
        })
    }
}

/// An audit event record.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub event_type: EventType,
    pub actor: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub comment: Option<String>,
    pub created_at: i64,
}

impl Event {
    /// Create a new event (id will be assigned by database).
    #[must_use]
    pub fn new(entity_type: &str, entity_id: &str, event_type: EventType, actor: &str) -> Self {
        Self {
            id: 0,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            event_type,
            actor: actor.to_string(),
            old_value: None,
            new_value: None,
            comment: None,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Add old/new values for field change tracking.
    #[must_use]
    pub fn with_values(mut self, old: Option<String>, new: Option<String>) -> Self {
        self.old_value = old;
        self.new_value = new;
        self
    }

    /// Add a comment to the event.
    #[must_use]
    pub fn with_comment(mut self, comment: &str) -> Self {
        self.comment = Some(comment.to_string());
        self
    }
}

/// Insert an event into the database.
///
/// # Errors
///
/// Returns an error if the insert fails.
pub fn insert_event(conn: &Connection, event: &Event) -> Result<i64> {
    conn.execute(
        "INSERT INTO events (entity_type, entity_id, event_type, actor, old_value, new_value, comment, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            event.entity_type,
            event.entity_id,
            event.event_type.as_str(),
            event.actor,
            event.old_value,
            event.new_value,
            event.comment,
            event.created_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Get events for an entity, newest first.
///
/// Rows with an unknown event type are skipped.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get_events(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
    limit: Option<u32>,
) -> Result<Vec<Event>> {
    let limit = limit.unwrap_or(100);
    let mut stmt = conn.prepare(
        "SELECT id, entity_type, entity_id, event_type, actor, old_value, new_value, comment, created_at
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY created_at DESC, id DESC
         LIMIT ?3",
    )?;

    let rows = stmt.query_map(rusqlite::params![entity_type, entity_id, limit], |row| {
        let kind: String = row.get(3)?;
        Ok(EventType::parse(&kind).map(|event_type| Event {
            id: row.get(0).unwrap_or_default(),
            entity_type: row.get(1).unwrap_or_default(),
            entity_id: row.get(2).unwrap_or_default(),
            event_type,
            actor: row.get(4).unwrap_or_default(),
            old_value: row.get(5).unwrap_or_default(),
            new_value: row.get(6).unwrap_or_default(),
            comment: row.get(7).unwrap_or_default(),
            created_at: row.get(8).unwrap_or_default(),
        }))
    })?;

    let mut events = Vec::new();
    for row in rows {
        if let Some(event) = row? {
            events.push(event);
        }
    }
    Ok(events)
}
