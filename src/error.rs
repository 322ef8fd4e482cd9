//! Error types for decksync.
//!
//! Provides structured error handling with:
//! - Machine-readable error codes (`ErrorCode`)
//! - Category-based exit codes (2=db, 3=not_found, 4=validation, etc.)
//! - Context-aware recovery hints
//! - Structured JSON output for piped / non-TTY consumers

use std::path::PathBuf;
use thiserror::Error;

use crate::sync::SyncError;

/// Result type alias for decksync operations.
pub type Result<T> = std::result::Result<T, Error>;

// ── Error Code ────────────────────────────────────────────────

/// Machine-readable error codes grouped by category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Database (exit 2)
    NotInitialized,
    AlreadyInitialized,
    DatabaseError,

    // Not Found (exit 3)
    CollectionNotFound,

    // Validation (exit 4)
    InvalidArgument,

    // Conflict (exit 5)
    CollectionExists,
    CollectionNotEmpty,

    // Sync (exit 6)
    FetchError,
    StorageError,
    Cancelled,

    // Config (exit 7)
    ConfigError,

    // I/O (exit 8)
    IoError,
    JsonError,

    // Destructive purge rejected (exit 9)
    ConfirmationDeclined,

    // Internal (exit 1)
    InternalError,
}

impl ErrorCode {
    /// Machine-readable SCREAMING_SNAKE code string.
    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::NotInitialized => "NOT_INITIALIZED",
            Self::AlreadyInitialized => "ALREADY_INITIALIZED",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::CollectionNotFound => "COLLECTION_NOT_FOUND",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::CollectionExists => "COLLECTION_EXISTS",
            Self::CollectionNotEmpty => "COLLECTION_NOT_EMPTY",
            Self::FetchError => "FETCH_ERROR",
            Self::StorageError => "STORAGE_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::ConfigError => "CONFIG_ERROR",
            Self::IoError => "IO_ERROR",
            Self::JsonError => "JSON_ERROR",
            Self::ConfirmationDeclined => "CONFIRMATION_DECLINED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Category-based exit code (1-9).
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::InternalError => 1,
            Self::NotInitialized | Self::AlreadyInitialized | Self::DatabaseError => 2,
            Self::CollectionNotFound => 3,
            Self::InvalidArgument => 4,
            Self::CollectionExists | Self::CollectionNotEmpty => 5,
            Self::FetchError | Self::StorageError | Self::Cancelled => 6,
            Self::ConfigError => 7,
            Self::IoError | Self::JsonError => 8,
            Self::ConfirmationDeclined => 9,
        }
    }

    /// Whether re-running the same command can succeed without other changes.
    ///
    /// Fetch failures and cancellations are transient. Storage failures roll
    /// back the affected collection, so a rerun starts from a clean state.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::FetchError | Self::StorageError | Self::Cancelled | Self::DatabaseError
        )
    }
}

// ── Error Enum ────────────────────────────────────────────────

/// Errors that can occur in decksync operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Not initialized: run `decksync init` first")]
    NotInitialized,

    #[error("Already initialized at {path}")]
    AlreadyInitialized { path: PathBuf },

    #[error("Collection not found: {id}")]
    CollectionNotFound { id: String },

    #[error("Collection already exists: {id}")]
    CollectionExists { id: String },

    #[error("Collection {id} still owns {notes} notes")]
    CollectionNotEmpty { id: String, notes: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Map this error to its machine-readable code.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::NotInitialized => ErrorCode::NotInitialized,
            Self::AlreadyInitialized { .. } => ErrorCode::AlreadyInitialized,
            Self::CollectionNotFound { .. } => ErrorCode::CollectionNotFound,
            Self::CollectionExists { .. } => ErrorCode::CollectionExists,
            Self::CollectionNotEmpty { .. } => ErrorCode::CollectionNotEmpty,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::Sync(err) => match err {
                SyncError::Fetch { .. } => ErrorCode::FetchError,
                SyncError::Storage(_) | SyncError::PlanChanged { .. } => ErrorCode::StorageError,
                SyncError::ConfirmationDeclined { .. } => ErrorCode::ConfirmationDeclined,
                SyncError::Cancelled { .. } => ErrorCode::Cancelled,
                SyncError::CollectionNotFound(_) => ErrorCode::CollectionNotFound,
            },
            Self::Database(_) => ErrorCode::DatabaseError,
            Self::Io(_) => ErrorCode::IoError,
            Self::Json(_) => ErrorCode::JsonError,
            Self::Config(_) => ErrorCode::ConfigError,
            Self::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Process exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        self.error_code().exit_code()
    }

    /// Context-aware recovery hint for humans and scripts.
    ///
    /// Returns `None` if no actionable suggestion exists.
    #[must_use]
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::NotInitialized => {
                Some("Run `decksync init` to create the local store".to_string())
            }

            Self::AlreadyInitialized { path } => Some(format!(
                "Database already exists at {}. Use `--force` to reinitialize.",
                path.display()
            )),

            Self::CollectionNotFound { id } => Some(format!(
                "No collection with ID '{id}'. Use `decksync collection list` to see registered collections."
            )),

            Self::CollectionExists { id } => Some(format!(
                "Pick another ID or inspect the existing one with `decksync collection show {id}`."
            )),

            Self::CollectionNotEmpty { id, .. } => Some(format!(
                "Disable its students and run `decksync sync run {id}` to purge them first."
            )),

            Self::Sync(SyncError::ConfirmationDeclined { .. }) => Some(
                "Nothing was written. Re-enable the students or rerun with `--yes`.".to_string(),
            ),

            Self::Sync(SyncError::Fetch { collection, .. }) => Some(format!(
                "Check the source of '{collection}' with `decksync collection show {collection}`."
            )),

            Self::InvalidArgument(msg) => {
                if msg.contains("toggle") {
                    Some("Valid values: on, off (synonyms: yes/no, true/false, 1/0)".to_string())
                } else if msg.contains("collection id") {
                    Some("Collection IDs use letters, digits, '-' and '_' only".to_string())
                } else {
                    None
                }
            }

            Self::Sync(_)
            | Self::Database(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Config(_)
            | Self::Other(_) => None,
        }
    }

    /// Structured JSON representation for machine consumption.
    #[must_use]
    pub fn to_structured_json(&self) -> serde_json::Value {
        let code = self.error_code();
        let mut obj = serde_json::json!({
            "error": {
                "code": code.as_str(),
                "message": self.to_string(),
                "retryable": code.is_retryable(),
                "exit_code": code.exit_code(),
            }
        });

        if let Some(hint) = self.hint() {
            obj["error"]["hint"] = serde_json::Value::String(hint);
        }

        obj
    }
}
