//! # Driver Errors
//!
//! Failures raised by the driver adapter and the sessions behind it.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for driver operations
pub type DriverResult<T> = Result<T, DriverError>;

/// Driver error types
///
/// Every variant carries enough context to identify the server, database or
/// table involved.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Server could not be reached
    #[error("Could not connect to {address}: {reason}")]
    Connection { address: String, reason: String },

    /// Credentials were rejected by the server
    #[error("Authentication failed for user '{user}'")]
    Authentication { user: String },

    /// Operation attempted on a closed connection or drained pool
    #[error("Connection is closed")]
    Closed,

    /// A query needs a target database but none was selected
    #[error("No database selected")]
    NoDatabaseSelected,

    #[error("Database '{0}' does not exist")]
    DatabaseNotFound(String),

    #[error("Database '{0}' already exists")]
    DatabaseExists(String),

    #[error("Table '{table}' does not exist in database '{database}'")]
    TableNotFound { database: String, table: String },

    #[error("Table '{table}' already exists in database '{database}'")]
    TableExists { database: String, table: String },

    #[error("Index '{index}' does not exist on table '{table}'")]
    IndexNotFound { table: String, index: String },

    #[error("Index '{index}' already exists on table '{table}'")]
    IndexExists { table: String, index: String },

    /// Inserted document collides with an existing primary key
    #[error("Duplicate primary key '{id}' in table '{table}'")]
    DuplicateKey { table: String, id: String },

    /// Server did not report the requested readiness in time
    #[error("Timed out after {seconds}s waiting for {what}")]
    Timeout { what: String, seconds: u64 },

    /// Query is malformed for the target it runs against
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Server-side persistence failed
    #[error("Failed to persist server state to {path:?}: {reason}")]
    Persistence { path: PathBuf, reason: String },
}

impl DriverError {
    /// Whether the error means the connection itself is unusable
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Authentication { .. } | Self::Closed
        )
    }
}
