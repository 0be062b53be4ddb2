//! # Migration Errors
//!
//! Every failure the engine can report, grouped the way they surface:
//! configuration, discovery I/O, migration code, ledger and connection.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use super::Direction;
use crate::driver::DriverError;
use crate::options::OptionError;

/// Result type for migration operations
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Migration error types
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Options failed validation; nothing was attempted
    #[error("Invalid options: {}", join_option_errors(.errors))]
    InvalidOptions { errors: Vec<OptionError> },

    /// Migrations directory could not be listed
    #[error("Failed to read migrations directory {path:?}: {source}")]
    DirectoryRead { path: PathBuf, source: io::Error },

    /// Migration or options file could not be read
    #[error("Failed to read file {path:?}: {source}")]
    FileRead { path: PathBuf, source: io::Error },

    /// Migration file could not be written
    #[error("Failed to write file {path:?}: {source}")]
    FileWrite { path: PathBuf, source: io::Error },

    /// Migration code could not be resolved from its file
    #[error("Failed to load migration '{filename}': {reason}")]
    LoadFailed { filename: String, reason: String },

    /// Filename matches the migration pattern but its timestamp is not a real instant
    #[error("Invalid timestamp '{value}' in migration filename '{filename}'")]
    InvalidTimestamp { filename: String, value: String },

    /// Migration name cannot be used in a filename
    #[error("Invalid migration name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// A ledger entry has no migration file to run
    #[error("Migration '{name}' is recorded in the ledger but no matching file was found")]
    MigrationNotFound { name: String },

    /// Migration code rejected
    #[error("Migration '{name}' failed while running {direction}: {reason}")]
    ExecutionFailed {
        name: String,
        direction: Direction,
        reason: String,
    },

    /// Ledger table could not be created, read or written
    #[error("Migrations table '{table}' error: {source}")]
    Ledger { table: String, source: DriverError },

    /// Ledger row could not be decoded
    #[error("Malformed entry in migrations table '{table}': {reason}")]
    MalformedEntry { table: String, reason: String },

    /// Connection level failure
    #[error(transparent)]
    Driver(#[from] DriverError),
}

fn join_option_errors(errors: &[OptionError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl MigrationError {
    /// Wrap a driver error raised while touching the ledger table
    pub fn ledger(table: &str, source: DriverError) -> Self {
        Self::Ledger {
            table: table.to_string(),
            source,
        }
    }

    /// Whether the error was raised before anything touched the database
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::InvalidOptions { .. })
    }
}
