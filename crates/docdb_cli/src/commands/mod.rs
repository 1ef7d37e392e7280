//! CLI command implementations.

pub mod checkpoint;
pub mod dump_wal;
pub mod find;
pub mod inspect;
pub mod verify;

use docdb_core::CoreError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors reported by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// No `--path` was given.
    #[error("database path required (use --path)")]
    MissingPath,

    /// The path holds no database.
    #[error("no database found at {0}")]
    NoDatabase(PathBuf),

    /// A command-line argument could not be used.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Verification found problems.
    #[error("verification failed with {0} problem(s)")]
    VerificationFailed(usize),

    /// Engine error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Storage error.
    #[error(transparent)]
    Storage(#[from] docdb_storage::StorageError),

    /// JSON output or input error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type of CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// How a command prints its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// Fails unless `path` looks like a docdb directory.
pub(crate) fn ensure_database(path: &std::path::Path) -> CliResult<()> {
    if path.join("LOCK").exists() || path.join(docdb_core::dir::WAL_DIR).is_dir() {
        Ok(())
    } else {
        Err(CliError::NoDatabase(path.to_path_buf()))
    }
}

pub(crate) fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
