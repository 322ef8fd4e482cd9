//! decksync - keeps flashcard decks in step with shared question banks
//!
//! A remote collection is a table of question rows, each assigned to zero or
//! more students. decksync fans every row out into one note per enabled
//! student, files it into a `DeckSync::<collection>::<student>::...` deck
//! tree, and keeps notes, decks and note types consistent as rows, students
//! and the collection name change.
//!
//! # Architecture
//!
//! - [`cli`] - Command-line interface using clap
//! - [`model`] - Data types (rows, partitions, notes, decks, registry)
//! - [`naming`] - Deck paths and note-type names
//! - [`source`] - Fetch collaborators producing remote rows
//! - [`storage`] - SQLite local store, configuration and run journal
//! - [`sync`] - Partitioning, reconciliation, naming and cleanup
//! - [`config`] - Database path and actor resolution
//! - [`error`] - Error types and handling

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod error;
pub mod model;
pub mod naming;
pub mod source;
pub mod storage;
pub mod sync;
pub mod validate;

pub use error::{Error, Result};
