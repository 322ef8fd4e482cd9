//! Data models for decksync.
//!
//! This module contains all domain models:
//! - RemoteRow / SyncUnit / PartitionKey (source side)
//! - LocalNote / NoteType / Deck / Variant (local store side)
//! - StudentRegistry (per-collection student selection state)
//! - Collection (a registered remote source)

pub mod collection;
pub mod note;
pub mod registry;
pub mod row;

pub use collection::Collection;
pub use note::{
    Deck, DeckPath, LocalNote, NOTE_FIELDS, NoteDraft, NoteType, NoteTypeBinding, UpsertOutcome,
    Variant, project_fields,
};
pub use registry::StudentRegistry;
pub use row::{MISSING_STUDENT_LABEL, PartitionKey, RemoteRow, SyncUnit};
