//! CLI errors and exit codes

use thiserror::Error;

use crate::driver::DriverError;
use crate::migrations::MigrationError;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("Failed to initialize logging: {0}")]
    Logging(String),

    #[error("Failed to prepare state file {path:?}: {source}")]
    StateFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

impl CliError {
    /// Process exit code: 2 for bad options, 1 for everything else
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Migration(e) if e.is_config_error() => 2,
            _ => 1,
        }
    }
}
