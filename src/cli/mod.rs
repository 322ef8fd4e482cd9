//! CLI definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Output format for list/query commands.
#[derive(ValueEnum, Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text (default)
    #[default]
    Table,
    /// JSON (same as --json)
    Json,
}

pub mod commands;

/// decksync - keep flashcard decks in step with shared question banks
#[derive(Parser, Debug)]
#[command(name = "decksync", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Database path (default: ~/.decksync/data/decksync.db)
    #[arg(long, global = true, env = "DECKSYNC_DB")]
    pub db: Option<PathBuf>,

    /// Actor name for audit trail
    #[arg(long, global = true, env = "DECKSYNC_ACTOR")]
    pub actor: Option<String>,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Output format (table, json)
    #[arg(long, value_enum, global = true, default_value_t)]
    pub format: OutputFormat,

    /// Preview changes without writing to the database
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize the local store
    Init {
        /// Recreate an existing database
        #[arg(long)]
        force: bool,
    },

    /// Print version information
    Version,

    /// Register and inspect remote collections
    Collection {
        #[command(subcommand)]
        command: CollectionCommands,
    },

    /// Choose which students a collection syncs
    Student {
        #[command(subcommand)]
        command: StudentCommands,
    },

    /// Reconcile collections into local decks
    Sync {
        #[command(subcommand)]
        command: SyncCommands,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Supported shells for completions.
#[derive(clap::ValueEnum, Clone, Debug)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

// ============================================================================
// Collection Commands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum CollectionCommands {
    /// Register a collection
    Add {
        /// Local collection ID (letters, digits, '-' and '_')
        id: String,

        /// Source locator (path to a JSON or JSONL file)
        source: String,

        /// Students to enable right away (comma-separated)
        #[arg(long, value_delimiter = ',')]
        students: Vec<String>,
    },

    /// List registered collections
    List,

    /// Show one collection with its registry state
    Show {
        /// Collection ID
        id: String,
    },

    /// Point a collection at a different source
    SetSource {
        /// Collection ID
        id: String,

        /// New source locator
        source: String,
    },

    /// Unregister a collection that owns no notes
    Remove {
        /// Collection ID
        id: String,
    },
}

// ============================================================================
// Student Commands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum StudentCommands {
    /// List known, enabled and synced students
    List {
        /// Collection ID
        collection: String,
    },

    /// Enable students for sync
    Enable {
        /// Collection ID
        collection: String,

        /// Student names
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Disable students (their notes are purged on the next confirmed sync)
    Disable {
        /// Collection ID
        collection: String,

        /// Student names
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Sync rows without students into the "No Student" partition
    Missing {
        /// Collection ID
        collection: String,

        /// on or off
        value: String,
    },
}

// ============================================================================
// Sync Commands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum SyncCommands {
    /// Sync collections (all registered collections when none are given)
    Run {
        /// Collection IDs
        collections: Vec<String>,

        /// Approve purges without prompting
        #[arg(short, long)]
        yes: bool,
    },

    /// Show note counts, registry state and recent runs
    Status {
        /// Collection ID (all collections when omitted)
        collection: Option<String>,

        /// Number of recent runs to show
        #[arg(long, default_value = "5")]
        runs: usize,
    },
}
